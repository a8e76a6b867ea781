use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Update,
    Delete,
}

/// The payload of every user log entry: an upsert or a delete of one JSON record. A delete removes
/// the key that an update of the same body would have written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub op: Op,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn update(body: Vec<u8>) -> Envelope {
        Envelope {
            op: Op::Update,
            body,
        }
    }

    pub fn delete(body: Vec<u8>) -> Envelope {
        Envelope {
            op: Op::Delete,
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_garbage_fails() {
        assert!(Envelope::decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn delete_keeps_body() {
        let bytes = Envelope::delete(b"{\"id\":1}".to_vec()).encode().unwrap();
        let envelope = Envelope::decode(&bytes).unwrap();
        assert_eq!(envelope.op, Op::Delete);
        assert_eq!(envelope.body, b"{\"id\":1}");
    }
}
