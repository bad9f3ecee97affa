use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One member of a JSON:API-flavored `data` array: a type tag, an
/// optional identifier, and the resource's own attributes.
#[derive(Debug, Serialize, Deserialize)]
pub struct Record<T> {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub attributes: T,
}

/// The envelope every list and create response is wrapped in. `errors`
/// is omitted from the wire payload when empty so a clean list response
/// has no trailing `"errors":[]` noise.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: Vec<Record<T>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl<T> Envelope<T> {
    pub fn list(kind: &str, items: Vec<T>) -> Envelope<T> {
        Envelope {
            data: items.into_iter().map(|attributes| Record { kind: kind.to_string(), id: None, attributes }).collect(),
            errors: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Envelope<T> {
        Envelope { data: Vec::new(), errors: vec![message.into()] }
    }
}

/// The request body accepted by `POST /api/v1/replica`.
#[derive(Debug, Deserialize)]
pub struct CreateRequest<T> {
    pub data: Vec<Record<T>>,
}
