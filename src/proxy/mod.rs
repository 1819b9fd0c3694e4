pub mod context;
mod handler;

pub use context::BoxBody;
pub use handler::handle_request;
