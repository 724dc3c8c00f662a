//! Execution context exchanged with workers.
//!
//! Every call carries an [`RpcContext`] serialized as JSON in the payload's
//! context field:
//!
//! ```json
//! { "service": "pkg.Greeter", "method": "Hello", "context": { "key": ["v"] } }
//! ```
//!
//! The `context` map holds the inbound gRPC metadata plus the reserved peer
//! keys [`PEER_ADDRESS`] and [`PEER_AUTH_TYPE`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Caller's network address, e.g. `127.0.0.1:53412`.
pub const PEER_ADDRESS: &str = ":peer.address";

/// Authentication scheme of the caller's connection, present only for TLS.
pub const PEER_AUTH_TYPE: &str = ":peer.auth-type";

/// Metadata keyed by name, each key holding its values in arrival order.
pub type ContextMap = BTreeMap<String, Vec<String>>;

/// Per-call context handed to the worker alongside the request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcContext {
    pub service: String,
    pub method: String,
    pub context: ContextMap,
}

impl RpcContext {
    pub fn new(service: impl Into<String>, method: impl Into<String>, context: ContextMap) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            context,
        }
    }

    /// Serializes the context as JSON into `buf`, replacing its contents but
    /// keeping its allocation.
    pub fn write_json(&self, buf: &mut Vec<u8>) -> serde_json::Result<()> {
        buf.clear();
        serde_json::to_writer(buf, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_service_method_and_metadata() {
        let mut context = ContextMap::new();
        context.insert("x-request-id".into(), vec!["abc".into()]);
        context.insert("accept".into(), vec!["a".into(), "b".into()]);
        context.insert(PEER_ADDRESS.into(), vec!["10.0.0.1:4000".into()]);
        let ctx = RpcContext::new("pkg.Greeter", "Hello", context);

        let mut buf = Vec::new();
        ctx.write_json(&mut buf).unwrap();
        let decoded: RpcContext = serde_json::from_slice(&buf).unwrap();

        assert_eq!(decoded, ctx);
    }

    #[test]
    fn wire_shape_uses_plain_field_names() {
        let ctx = RpcContext::new("pkg.Greeter", "Hello", ContextMap::new());
        let value: serde_json::Value = serde_json::to_value(&ctx).unwrap();

        assert_eq!(value["service"], "pkg.Greeter");
        assert_eq!(value["method"], "Hello");
        assert!(value["context"].as_object().unwrap().is_empty());
    }

    #[test]
    fn write_json_replaces_previous_contents() {
        let mut buf = b"stale bytes from an earlier call".to_vec();
        RpcContext::new("a.B", "C", ContextMap::new())
            .write_json(&mut buf)
            .unwrap();

        assert_eq!(buf, br#"{"service":"a.B","method":"C","context":{}}"#);
    }
}
