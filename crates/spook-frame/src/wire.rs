#![forbid(unsafe_code)]

//! The cross-frame message vocabulary.
//!
//! Shapes are part of the protocol and must stay bit-exact:
//!
//! - child → parent: `{"helloSpookProxy":true}`, `{"useSpook":"<uuid>"}`,
//!   `{"dropSpook":"<uuid>"}`;
//! - parent → child: `{"spookProxyInfo":{"deferParentPrefix":"..."}}`,
//!   `{"spookCacheUpdate":{"uuid":"...","value":...}}` (or `"valueString"`,
//!   or neither for not-ready), `{"spookUnknown":{"uuid":"..."}}`.
//!
//! Serde's external enum tagging produces exactly these one-key objects.

use serde::{Deserialize, Serialize};

use spook::Value;

/// Messages a child runtime sends its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FromChild {
    /// Handshake; the parent answers with [`ToChild::Info`].
    #[serde(rename = "helloSpookProxy")]
    Hello(bool),
    /// Register interest in a UUID.
    #[serde(rename = "useSpook")]
    Use(String),
    /// Drop interest in a UUID.
    #[serde(rename = "dropSpook")]
    Drop(String),
}

/// Payload of [`ToChild::Info`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyInfo {
    #[serde(rename = "deferParentPrefix")]
    pub defer_parent_prefix: String,
}

/// Payload of [`ToChild::CacheUpdate`]. Exactly one of `value` /
/// `value_string` is present for a ready value; both absent means not-ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheUpdate {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(
        rename = "valueString",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub value_string: Option<String>,
}

/// Payload of [`ToChild::Unknown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unknown {
    pub uuid: String,
}

/// Messages a parent proxy sends a child runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToChild {
    #[serde(rename = "spookProxyInfo")]
    Info(ProxyInfo),
    #[serde(rename = "spookCacheUpdate")]
    CacheUpdate(CacheUpdate),
    #[serde(rename = "spookUnknown")]
    Unknown(Unknown),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(value: &impl Serialize) -> String {
        serde_json::to_string(value).expect("serializable message")
    }

    #[test]
    fn child_messages_have_the_wire_shape() {
        assert_eq!(text(&FromChild::Hello(true)), r#"{"helloSpookProxy":true}"#);
        assert_eq!(
            text(&FromChild::Use("b39f".to_owned())),
            r#"{"useSpook":"b39f"}"#
        );
        assert_eq!(
            text(&FromChild::Drop("b39f".to_owned())),
            r#"{"dropSpook":"b39f"}"#
        );
    }

    #[test]
    fn parent_messages_have_the_wire_shape() {
        assert_eq!(
            text(&ToChild::Info(ProxyInfo {
                defer_parent_prefix: "parent.".to_owned()
            })),
            r#"{"spookProxyInfo":{"deferParentPrefix":"parent."}}"#
        );
        assert_eq!(
            text(&ToChild::Unknown(Unknown {
                uuid: "x".to_owned()
            })),
            r#"{"spookUnknown":{"uuid":"x"}}"#
        );
    }

    #[test]
    fn cache_update_omits_absent_fields() {
        assert_eq!(
            text(&ToChild::CacheUpdate(CacheUpdate {
                uuid: "x".to_owned(),
                value: Some(json!(42)),
                value_string: None,
            })),
            r#"{"spookCacheUpdate":{"uuid":"x","value":42}}"#
        );
        assert_eq!(
            text(&ToChild::CacheUpdate(CacheUpdate {
                uuid: "x".to_owned(),
                value: None,
                value_string: Some("{\"a\":1}".to_owned()),
            })),
            r#"{"spookCacheUpdate":{"uuid":"x","valueString":"{\"a\":1}"}}"#
        );
        assert_eq!(
            text(&ToChild::CacheUpdate(CacheUpdate {
                uuid: "x".to_owned(),
                value: None,
                value_string: None,
            })),
            r#"{"spookCacheUpdate":{"uuid":"x"}}"#
        );
    }

    #[test]
    fn messages_round_trip() {
        let messages = vec![
            ToChild::Info(ProxyInfo {
                defer_parent_prefix: "p.".to_owned(),
            }),
            ToChild::CacheUpdate(CacheUpdate {
                uuid: "u".to_owned(),
                value: Some(json!({"n": 1})),
                value_string: None,
            }),
            ToChild::Unknown(Unknown {
                uuid: "u".to_owned(),
            }),
        ];
        for message in messages {
            let parsed: ToChild = serde_json::from_str(&text(&message)).expect("parseable");
            assert_eq!(parsed, message);
        }
    }
}
