// Node reply decoding.
// REPLY    -> {"op":"REPLY","result":{"seqNo":..,"txnTime":..,"data":..}}
// REJECT   -> {"op":"REJECT","reason":".."}
// REQNACK  -> {"op":"REQNACK","reason":".."}
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// Node executed the request.
    Reply {
        document: Option<Value>,
        deactivated: bool,
        metadata: ReplyMetadata,
    },
    /// Node refused the request (authorization, validation, duplicate).
    Rejected { reason: String },
}

/// Ledger metadata carried by a REPLY.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyMetadata {
    pub seq_no: Option<u64>,
    pub txn_time: Option<u64>,
    pub last_txn_time: Option<u64>,
}

#[derive(Deserialize)]
struct RawReply {
    op: String,
    #[serde(default)]
    result: Option<RawResult>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResult {
    #[serde(default)]
    seq_no: Option<u64>,
    #[serde(default)]
    txn_time: Option<u64>,
    #[serde(default)]
    state_proof: Option<RawStateProof>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStateProof {
    #[serde(default)]
    multi_signature: Option<RawMultiSignature>,
}

#[derive(Deserialize)]
struct RawMultiSignature {
    #[serde(default)]
    value: Option<RawMultiSignatureValue>,
}

#[derive(Deserialize)]
struct RawMultiSignatureValue {
    #[serde(default)]
    timestamp: Option<u64>,
}

/// Decodes one node reply. Returns `Err` with a short reason for undecodable bytes.
pub fn parse_reply(bytes: &[u8]) -> Result<ReplyBody, String> {
    let raw: RawReply = serde_json::from_slice(bytes).map_err(|e| format!("malformed reply: {}", e))?;

    match raw.op.as_str() {
        "REPLY" => {
            let result = raw.result.ok_or_else(|| "REPLY without result".to_string())?;
            let last_txn_time = result
                .state_proof
                .as_ref()
                .and_then(|sp| sp.multi_signature.as_ref())
                .and_then(|ms| ms.value.as_ref())
                .and_then(|v| v.timestamp);
            let (document, deactivated) = decode_data(result.data)?;
            Ok(ReplyBody::Reply {
                document,
                deactivated,
                metadata: ReplyMetadata {
                    seq_no: result.seq_no,
                    txn_time: result.txn_time,
                    last_txn_time,
                },
            })
        }
        "REJECT" | "REQNACK" => Ok(ReplyBody::Rejected {
            reason: raw.reason.unwrap_or_else(|| raw.op.clone()),
        }),
        other => Err(format!("unknown reply op '{}'", other)),
    }
}

// `data` may be null, an object, or a JSON string holding the document.
fn decode_data(data: Value) -> Result<(Option<Value>, bool), String> {
    let value = match data {
        Value::Null => return Ok((None, false)),
        Value::String(s) => serde_json::from_str::<Value>(&s).map_err(|e| format!("data is not JSON: {}", e))?,
        other => other,
    };
    if value.is_null() {
        return Ok((None, false));
    }
    let deactivated = value.get("deactivated").and_then(Value::as_bool).unwrap_or(false);
    Ok((Some(value), deactivated))
}
