pub mod exchange;
pub mod headers;
pub mod ingress;
pub mod proxy;

pub use exchange::{BoxBody, Gateway};
pub use ingress::{HttpIngress, IngressConfig, JwtGenerator};
pub use proxy::LocalProxy;
