//! Byte-bounded job payloads.

use serde_json::Value;
use tracing::warn;

/// One job payload: request lines whose serialized size stays under the cap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub index: usize,
    /// Document keys, in request order.
    pub keys: Vec<String>,
    pub requests: Vec<Value>,
    /// Serialized JSONL size, newlines included.
    pub bytes: usize,
}

impl Chunk {
    /// The payload as JSONL, one request per line.
    pub fn to_jsonl(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for request in &self.requests {
            out.extend_from_slice(crate::codec::batch_line::to_line(request).as_bytes());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Split `(key, request)` pairs into chunks of at most `max_bytes`.
///
/// A single request larger than the cap gets a chunk of its own; the
/// service decides whether to accept it.
pub fn plan_chunks(requests: Vec<(String, Value)>, max_bytes: usize) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current = Chunk::default();

    for (key, request) in requests {
        let size = request.to_string().len() + 1;
        if !current.is_empty() && current.bytes + size > max_bytes {
            let index = current.index;
            chunks.push(std::mem::replace(
                &mut current,
                Chunk {
                    index: index + 1,
                    ..Chunk::default()
                },
            ));
        }
        if size > max_bytes {
            warn!(document = %key, bytes = size, max_bytes, "Request exceeds the chunk cap on its own");
        }
        current.keys.push(key);
        current.requests.push(request);
        current.bytes += size;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(key: &str, filler: usize) -> (String, Value) {
        (key.to_string(), json!({ "key": key, "data": "x".repeat(filler) }))
    }

    #[test]
    fn splits_on_byte_cap() {
        let one = request("a", 100).1.to_string().len() + 1;
        let chunks = plan_chunks(
            vec![request("a", 100), request("b", 100), request("c", 100)],
            one * 2,
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].keys, vec!["a", "b"]);
        assert_eq!(chunks[1].keys, vec!["c"]);
        assert_eq!(chunks[1].index, 1);
        assert!(chunks.iter().all(|c| c.bytes <= one * 2));
        assert_eq!(chunks[0].to_jsonl().len(), chunks[0].bytes);
    }

    #[test]
    fn oversized_request_stands_alone() {
        let chunks = plan_chunks(vec![request("a", 10), request("big", 5000), request("c", 10)], 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].keys, vec!["big"]);
    }

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(plan_chunks(Vec::new(), 1024).is_empty());
    }
}
