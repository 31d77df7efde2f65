mod proxy;
mod relay;

pub use proxy::{GatewayState, MAX_BODY_BYTES, proxy_router};
