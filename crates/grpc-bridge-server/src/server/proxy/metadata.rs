//! Conversion between gRPC metadata and the worker's JSON context.
//!
//! Requests: every inbound metadata entry plus the caller's peer information
//! is collected into a [`ContextMap`]. ASCII values are passed verbatim,
//! binary (`-bin`) values in their base64 wire form.
//!
//! Responses: the worker may return a JSON object of `{ key: [values] }` in
//! the response context. Those entries become response metadata, except the
//! reserved `"error"` key, whose first value is a base64 encoded
//! `google.rpc.Status` that replaces the successful response with that
//! status. An embedded status with code `OK` leaves the response untouched.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use grpc_bridge_core::{ContextMap, Error, PEER_ADDRESS, PEER_AUTH_TYPE, RpcStatus};
use prost::Message;
use serde::Deserialize;
use std::collections::BTreeMap;
use tonic::Request;
use tonic::metadata::{
    AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue,
    KeyAndValueRef, MetadataMap,
};
use tonic::transport::server::{TcpConnectInfo, TlsConnectInfo};

/// Response context key carrying an embedded status.
pub const ERROR_KEY: &str = "error";

/// Auth type reported for callers connected over TLS.
pub const TLS_AUTH_TYPE: &str = "tls";

/// Binary metadata values are base64 with optional padding on the wire.
const BINARY_VALUE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Collects the request's metadata and peer information.
pub fn request_context<T>(request: &Request<T>) -> ContextMap {
    let mut context = ContextMap::new();

    for entry in request.metadata().iter() {
        let (key, value) = match entry {
            KeyAndValueRef::Ascii(key, value) => (key.as_str(), value.as_encoded_bytes()),
            KeyAndValueRef::Binary(key, value) => (key.as_str(), value.as_encoded_bytes()),
        };
        context
            .entry(key.to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value).into_owned());
    }

    if let Some(addr) = peer_address(request) {
        context.insert(PEER_ADDRESS.to_owned(), vec![addr]);
    }
    if let Some(auth) = peer_auth_type(request) {
        context.insert(PEER_AUTH_TYPE.to_owned(), vec![auth.to_owned()]);
    }

    context
}

fn peer_address<T>(request: &Request<T>) -> Option<String> {
    if let Some(addr) = request.remote_addr() {
        return Some(addr.to_string());
    }

    #[cfg(unix)]
    if let Some(info) = request
        .extensions()
        .get::<tonic::transport::server::UdsConnectInfo>()
    {
        let path = info
            .peer_addr
            .as_ref()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()));
        return Some(path.unwrap_or_else(|| "@".to_owned()));
    }

    None
}

fn peer_auth_type<T>(request: &Request<T>) -> Option<&'static str> {
    request
        .extensions()
        .get::<TlsConnectInfo<TcpConnectInfo>>()
        .map(|_| TLS_AUTH_TYPE)
}

/// Metadata values as sent by workers: a list, or a bare string.
#[derive(Deserialize)]
#[serde(untagged)]
enum Values {
    Many(Vec<String>),
    One(String),
}

impl From<Values> for Vec<String> {
    fn from(values: Values) -> Self {
        match values {
            Values::Many(v) => v,
            Values::One(v) => vec![v],
        }
    }
}

/// Metadata recovered from a worker response.
#[derive(Debug, Default, PartialEq)]
pub struct ResponseMetadata {
    pub metadata: ContextMap,
    /// Status the worker asked to return instead of the response.
    pub error: Option<RpcStatus>,
}

impl ResponseMetadata {
    /// Parses a worker response context. An empty context yields empty
    /// metadata.
    ///
    /// # Errors
    ///
    /// Fails when the context is not a JSON object of string lists, or when an
    /// embedded status is not valid base64 or protobuf.
    pub fn parse(context: &[u8]) -> Result<Self, Error> {
        if context.is_empty() {
            return Ok(Self::default());
        }

        let raw: BTreeMap<String, Values> =
            serde_json::from_slice(context).map_err(Error::ContextDecode)?;
        let metadata: ContextMap = raw.into_iter().map(|(k, v)| (k, v.into())).collect();

        let error = match metadata.get(ERROR_KEY).and_then(|values| values.first()) {
            Some(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
                Some(RpcStatus::decode(bytes.as_slice())?).filter(|status| status.code != 0)
            }
            None => None,
        };

        Ok(Self { metadata, error })
    }

    /// Returns the metadata to attach, or the embedded status as the error.
    pub fn into_result(self) -> Result<ContextMap, tonic::Status> {
        match self.error {
            Some(status) => Err(status.into_status()),
            None => Ok(self.metadata),
        }
    }
}

/// Appends worker metadata to outgoing response metadata.
///
/// Keys ending in `-bin` take base64 values. Entries that are not valid gRPC
/// metadata are skipped.
pub fn apply_metadata(metadata: &ContextMap, target: &mut MetadataMap) {
    for (key, values) in metadata {
        if key.ends_with("-bin") {
            let Ok(name) = BinaryMetadataKey::from_bytes(key.as_bytes()) else {
                tracing::warn!(key = %key, "skipping invalid binary metadata key");
                continue;
            };
            for value in values {
                match BINARY_VALUE.decode(value) {
                    Ok(bytes) => {
                        target.append_bin(name.clone(), BinaryMetadataValue::from_bytes(&bytes));
                    }
                    Err(e) => tracing::warn!(key = %key, "skipping binary metadata value: {e}"),
                }
            }
        } else {
            let Ok(name) = AsciiMetadataKey::from_bytes(key.as_bytes()) else {
                tracing::warn!(key = %key, "skipping invalid metadata key");
                continue;
            };
            for value in values {
                match AsciiMetadataValue::try_from(value.as_str()) {
                    Ok(value) => {
                        target.append(name.clone(), value);
                    }
                    Err(e) => tracing::warn!(key = %key, "skipping metadata value: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use std::net::SocketAddr;
    use tonic::Code;

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_context_yields_empty_metadata() {
        let parsed = ResponseMetadata::parse(b"").unwrap();

        assert_eq!(parsed, ResponseMetadata::default());
        assert_eq!(parsed.into_result().unwrap(), ContextMap::new());
    }

    #[test]
    fn ordinary_keys_are_preserved() {
        let parsed = ResponseMetadata::parse(br#"{"x-a":["1","2"],"x-b":["3"]}"#).unwrap();
        let metadata = parsed.into_result().unwrap();

        assert_eq!(metadata.get("x-a"), Some(&values(&["1", "2"])));
        assert_eq!(metadata.get("x-b"), Some(&values(&["3"])));
        assert_eq!(metadata.len(), 2);
    }

    #[test]
    fn bare_string_values_are_accepted() {
        let parsed = ResponseMetadata::parse(br#"{"x-a":"1"}"#).unwrap();

        assert_eq!(parsed.metadata.get("x-a"), Some(&values(&["1"])));
    }

    #[test]
    fn embedded_error_overrides_success() {
        let encoded = STANDARD.encode(RpcStatus::new(3, "bad arg").encode_to_vec());
        let context = format!(r#"{{"error":["{encoded}"],"x-a":["1"]}}"#);

        let status = ResponseMetadata::parse(context.as_bytes())
            .unwrap()
            .into_result()
            .unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "bad arg");
    }

    #[test]
    fn embedded_ok_status_is_not_an_error() {
        let encoded = STANDARD.encode(RpcStatus::new(0, "").encode_to_vec());
        let context = format!(r#"{{"error":["{encoded}"],"x-a":["1"]}}"#);

        let parsed = ResponseMetadata::parse(context.as_bytes()).unwrap();
        assert!(parsed.error.is_none());

        let metadata = parsed.into_result().unwrap();
        assert_eq!(metadata.get("x-a"), Some(&values(&["1"])));
    }

    #[test]
    fn empty_error_list_is_ordinary_metadata() {
        let parsed = ResponseMetadata::parse(br#"{"error":[]}"#).unwrap();

        assert!(parsed.error.is_none());
        assert_eq!(parsed.metadata.get(ERROR_KEY), Some(&Vec::new()));
    }

    #[test]
    fn malformed_json_is_a_hard_error() {
        let err = ResponseMetadata::parse(b"{not json").unwrap_err();

        assert!(matches!(err, Error::ContextDecode(_)));
        assert_eq!(tonic::Status::from(err).code(), Code::Internal);
    }

    #[test]
    fn malformed_embedded_status_is_a_hard_error() {
        let err = ResponseMetadata::parse(br#"{"error":["***"]}"#).unwrap_err();
        assert!(matches!(err, Error::EmbeddedStatusEncoding(_)));

        let garbage = STANDARD.encode([0xff, 0xff, 0xff]);
        let context = format!(r#"{{"error":["{garbage}"]}}"#);
        let err = ResponseMetadata::parse(context.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::EmbeddedStatusDecode(_)));
    }

    #[test]
    fn request_context_collects_metadata_and_peer() {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .append("x-multi", "a".parse().unwrap());
        request
            .metadata_mut()
            .append("x-multi", "b".parse().unwrap());
        request
            .metadata_mut()
            .append_bin("trace-bin", BinaryMetadataValue::from_bytes(b"\x01\x02\x03"));
        let addr: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        request.extensions_mut().insert(TcpConnectInfo {
            local_addr: None,
            remote_addr: Some(addr),
        });

        let context = request_context(&request);

        assert_eq!(context.get("x-multi"), Some(&values(&["a", "b"])));
        assert_eq!(
            context.get("trace-bin"),
            Some(&values(&[&STANDARD.encode(b"\x01\x02\x03")]))
        );
        assert_eq!(context.get(PEER_ADDRESS), Some(&values(&["10.1.2.3:4567"])));
        assert!(!context.contains_key(PEER_AUTH_TYPE));
    }

    #[test]
    fn request_without_peer_has_no_peer_keys() {
        let context = request_context(&Request::new(()));

        assert!(context.is_empty());
    }

    #[test]
    fn apply_metadata_skips_invalid_entries() {
        let mut metadata = ContextMap::new();
        metadata.insert("x-ok".into(), values(&["1", "2"]));
        metadata.insert("bad key".into(), values(&["1"]));
        metadata.insert("x-bad-value".into(), values(&["line\nbreak"]));
        metadata.insert("x-data-bin".into(), values(&[&STANDARD.encode(b"raw")]));

        let mut target = MetadataMap::new();
        apply_metadata(&metadata, &mut target);

        let ok: Vec<_> = target
            .get_all("x-ok")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(ok, values(&["1", "2"]));
        assert!(target.get("x-bad-value").is_none());
        assert_eq!(
            target.get_bin("x-data-bin").unwrap().to_bytes().unwrap().as_ref(),
            b"raw"
        );
        assert_eq!(target.len(), 3);
    }
}
