pub mod proxy;
pub mod router;

pub use proxy::{ProxyRequest, ProxyResponse, RequestRouter, UpstreamConfig};
pub use router::{RouteDefinition, RouteMatch, RouteTable};
