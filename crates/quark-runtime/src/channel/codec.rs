//! Payload encoding (MessagePack with named fields).

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ChannelError;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ChannelError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ChannelError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    use crate::engine::PageLaunch;
    use crate::message::EngineCall;

    #[test]
    fn test_value_preserves_number_kinds() {
        let value = json!({
            "int": 42,
            "neg": -7,
            "float": 1.5,
            "big": u64::MAX,
            "nested": { "list": [null, true, "s", [1, 2]] }
        });
        let decoded: Value = decode(&encode(&value).unwrap()).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(decoded["int"].as_i64(), Some(42));
        assert!(decoded["float"].is_f64());
    }

    #[test]
    fn test_engine_call_survives_encoding() {
        let call = EngineCall::CreatePage(PageLaunch {
            app_id: 1,
            page_id: 2,
            script: "export default {}".into(),
            style: String::new(),
            params: json!({ "from": "home" }),
            intent: json!({ "action": "view" }),
            meta: Value::Null,
        });
        let decoded: EngineCall = decode(&encode(&call).unwrap()).unwrap();
        assert_eq!(decoded, call);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode::<EngineCall>(&[0xc1, 0x00]).is_err());
    }
}
