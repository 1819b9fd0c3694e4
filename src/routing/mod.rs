mod prefix;

pub use prefix::{PrefixRouter, RouteMatch};
