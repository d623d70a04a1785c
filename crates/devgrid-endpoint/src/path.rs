use std::fmt;

use crate::error::{EndpointError, EndpointResult};

const SCHEME: &str = "devgrid://";

/// Name-derived address of an endpoint: `devgrid://{node}/user/{name}[/{child}...]`.
///
/// A path is only a lookup key. Holding one says nothing about whether an
/// endpoint currently lives there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointPath(String);

impl EndpointPath {
    /// Path of a top-level endpoint on the given node.
    pub fn user(node_address: &str, name: &str) -> EndpointResult<Self> {
        validate_name(name)?;
        Ok(Self(format!("{SCHEME}{node_address}/user/{name}")))
    }

    /// Path of a child of this endpoint.
    pub fn child(&self, name: &str) -> EndpointResult<Self> {
        validate_name(name)?;
        Ok(Self(format!("{}/{name}", self.0)))
    }

    /// Node address segment of the path.
    pub fn node_address(&self) -> &str {
        let rest = self.0.strip_prefix(SCHEME).unwrap_or(&self.0);
        rest.split_once("/user/").map_or(rest, |(node, _)| node)
    }

    /// Last segment of the path.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_name(name: &str) -> EndpointResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(EndpointError::InvalidName(name.to_string()));
    }
    Ok(())
}
