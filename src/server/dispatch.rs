//! Request dispatcher: decode payload → authorize → route to the store →
//! encode response.

use std::collections::BTreeMap;
use std::io::Write;

use tracing::error;

use crate::catalog::DEFAULT_DATABASE;
use crate::engine::EngineError;
use crate::protocol::{self, ErrorCode, RequestType, ResponseType};
use crate::store::{BatchItem, Store, StoreError};
use crate::value::{self, Document, Value};
use crate::wal::EntryKind;

/// What the connection loop should do with the dispatched request.
pub enum Outcome {
    /// Write the frame and keep serving.
    Respond(ResponseType, Vec<u8>),
    /// Write the frame, then close the connection.
    RespondAndClose(ResponseType, Vec<u8>),
    /// Close without writing (internal failure mid-encode).
    Close,
}

/// Routes one decoded request.
pub fn dispatch(
    store: &Store,
    request: RequestType,
    payload: &[u8],
    authenticated: &mut bool,
) -> Outcome {
    let fields = if payload.is_empty() {
        Document::new()
    } else {
        match value::unpack_document(payload) {
            Ok(map) => map,
            Err(e) => {
                return respond_error(
                    ErrorCode::BadRequest,
                    &format!("malformed payload: {e}"),
                    false,
                );
            }
        }
    };

    if request == RequestType::Connect {
        return handle_connect(store, &fields, authenticated);
    }
    if !*authenticated {
        return respond_error(
            ErrorCode::Unauthenticated,
            "CONNECT with credentials required first",
            false,
        );
    }

    let result = match request {
        RequestType::Connect => unreachable!("handled above"),
        RequestType::Ping => Ok(Outcome::Respond(ResponseType::Pong, Vec::new())),
        RequestType::Create => handle_create(store, &fields),
        RequestType::Read => handle_read(store, &fields),
        RequestType::Update => handle_update(store, &fields),
        RequestType::Delete => handle_delete(store, &fields),
        RequestType::Query => handle_query(store, &fields),
        RequestType::VectorSearch => handle_vector_search(store, &fields),
        RequestType::BatchWrite => handle_batch_write(store, &fields),
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            let (code, close) = classify(&e);
            if code == ErrorCode::Internal {
                error!(error = %e, "request failed with internal error");
            }
            respond_error(code, &e.to_string(), close)
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Handlers
// ------------------------------------------------------------------------------------------------

fn handle_connect(store: &Store, fields: &Document, authenticated: &mut bool) -> Outcome {
    if !store.config().auth_required {
        *authenticated = true;
        return respond_success(Document::new());
    }

    let (username, password) = match (str_field(fields, "username"), str_field(fields, "password"))
    {
        (Ok(u), Ok(p)) => (u, p),
        _ => {
            // Malformed CONNECT closes like bad credentials do.
            return respond_error(
                ErrorCode::Unauthenticated,
                "CONNECT requires username and password",
                true,
            );
        }
    };

    match store.verify_credentials(username, password) {
        Ok(true) => {
            *authenticated = true;
            respond_success(Document::new())
        }
        Ok(false) => respond_error(ErrorCode::Unauthenticated, "invalid credentials", true),
        Err(e) => {
            error!(error = %e, "credential check failed");
            Outcome::Close
        }
    }
}

fn handle_create(store: &Store, fields: &Document) -> Result<Outcome, StoreError> {
    let collection = str_field(fields, "collection")?;
    let database = database_field(fields)?;
    let data = match fields.get("data") {
        Some(Value::Map(map)) => map.clone(),
        Some(other) => {
            return Err(StoreError::BadRequest(format!(
                "'data' must be a map, got {}",
                other.type_name()
            )));
        }
        None => return Err(StoreError::BadRequest("missing 'data'".into())),
    };

    let id = store.create_document(database, collection, data)?;

    let mut reply = Document::new();
    reply.insert("_id".to_string(), Value::Str(id));
    Ok(respond_success(reply))
}

fn handle_read(store: &Store, fields: &Document) -> Result<Outcome, StoreError> {
    let collection = str_field(fields, "collection")?;
    let database = database_field(fields)?;
    let key = str_field(fields, "key")?;

    match store.read_document(database, collection, key)? {
        Some(doc) => {
            let mut reply = Document::new();
            reply.insert("document".to_string(), Value::Map(doc));
            Ok(respond_success(reply))
        }
        None => Ok(respond_not_found()),
    }
}

fn handle_update(store: &Store, fields: &Document) -> Result<Outcome, StoreError> {
    let collection = str_field(fields, "collection")?;
    let database = database_field(fields)?;
    let key = str_field(fields, "key")?;
    let updates = match fields.get("updates") {
        Some(Value::Map(map)) => map.clone(),
        Some(other) => {
            return Err(StoreError::BadRequest(format!(
                "'updates' must be a map, got {}",
                other.type_name()
            )));
        }
        None => return Err(StoreError::BadRequest("missing 'updates'".into())),
    };

    if store.update_document(database, collection, key, updates)? {
        Ok(respond_success(Document::new()))
    } else {
        Ok(respond_not_found())
    }
}

fn handle_delete(store: &Store, fields: &Document) -> Result<Outcome, StoreError> {
    let collection = str_field(fields, "collection")?;
    let database = database_field(fields)?;
    let key = str_field(fields, "key")?;

    if store.delete_document(database, collection, key)? {
        Ok(respond_success(Document::new()))
    } else {
        Ok(respond_not_found())
    }
}

fn handle_query(store: &Store, fields: &Document) -> Result<Outcome, StoreError> {
    let collection = str_field(fields, "collection")?;
    let database = database_field(fields)?;

    let filters: BTreeMap<String, Value> = match fields.get("filters") {
        Some(Value::Map(map)) => map.clone(),
        Some(other) => {
            return Err(StoreError::BadRequest(format!(
                "'filters' must be a map, got {}",
                other.type_name()
            )));
        }
        None => BTreeMap::new(),
    };

    let limit = match fields.get("limit") {
        Some(Value::Int(n)) if *n >= 0 => Some(*n as usize),
        Some(Value::Int(n)) => {
            return Err(StoreError::BadRequest(format!("negative limit {n}")));
        }
        Some(other) => {
            return Err(StoreError::BadRequest(format!(
                "'limit' must be an integer, got {}",
                other.type_name()
            )));
        }
        None => None,
    };

    let documents = store.query(database, collection, &filters, limit)?;

    let mut reply = Document::new();
    reply.insert(
        "documents".to_string(),
        Value::List(documents.into_iter().map(Value::Map).collect()),
    );
    Ok(respond_success(reply))
}

fn handle_vector_search(store: &Store, fields: &Document) -> Result<Outcome, StoreError> {
    let collection = str_field(fields, "collection")?;
    let database = database_field(fields)?;

    let query = match fields.get("vector") {
        Some(Value::List(items)) => {
            let mut vector = Vec::with_capacity(items.len());
            for item in items {
                match item.as_f64() {
                    Some(v) => vector.push(v as f32),
                    None => {
                        return Err(StoreError::BadRequest(format!(
                            "'vector' elements must be numbers, got {}",
                            item.type_name()
                        )));
                    }
                }
            }
            vector
        }
        Some(other) => {
            return Err(StoreError::BadRequest(format!(
                "'vector' must be a list, got {}",
                other.type_name()
            )));
        }
        None => return Err(StoreError::BadRequest("missing 'vector'".into())),
    };

    let k = match fields.get("k") {
        Some(Value::Int(n)) if *n > 0 => *n as usize,
        Some(Value::Int(n)) => {
            return Err(StoreError::BadRequest(format!("non-positive k {n}")));
        }
        Some(other) => {
            return Err(StoreError::BadRequest(format!(
                "'k' must be an integer, got {}",
                other.type_name()
            )));
        }
        None => 10,
    };

    let hits = store.vector_search(database, collection, &query, k)?;

    let results: Vec<Value> = hits
        .into_iter()
        .map(|hit| {
            let mut entry = Document::new();
            entry.insert("_id".to_string(), Value::Str(hit.id));
            entry.insert("distance".to_string(), Value::Float(hit.distance as f64));
            entry.insert("document".to_string(), Value::Map(hit.document));
            Value::Map(entry)
        })
        .collect();

    let mut reply = Document::new();
    reply.insert("results".to_string(), Value::List(results));
    Ok(respond_success(reply))
}

fn handle_batch_write(store: &Store, fields: &Document) -> Result<Outcome, StoreError> {
    let collection = str_field(fields, "collection")?;
    let database = database_field(fields)?;

    let ops = match fields.get("ops") {
        Some(Value::List(items)) => items,
        Some(other) => {
            return Err(StoreError::BadRequest(format!(
                "'ops' must be a list, got {}",
                other.type_name()
            )));
        }
        None => return Err(StoreError::BadRequest("missing 'ops'".into())),
    };

    let mut items = Vec::with_capacity(ops.len());
    for op in ops {
        let Value::Map(op) = op else {
            return Err(StoreError::BadRequest("each op must be a map".into()));
        };

        let kind = match op.get("kind").and_then(Value::as_str) {
            Some("put") => EntryKind::Put,
            Some("delete") => EntryKind::Delete,
            Some(other) => {
                return Err(StoreError::BadRequest(format!("unknown op kind '{other}'")));
            }
            None => return Err(StoreError::BadRequest("op missing 'kind'".into())),
        };

        let id = op
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::BadRequest("op missing 'key'".into()))?
            .to_string();

        let data = match op.get("data") {
            Some(Value::Map(map)) => Some(map.clone()),
            Some(other) => {
                return Err(StoreError::BadRequest(format!(
                    "op 'data' must be a map, got {}",
                    other.type_name()
                )));
            }
            None => None,
        };

        items.push(BatchItem { kind, id, data });
    }

    let count = store.batch_write(database, collection, items)?;

    let mut reply = Document::new();
    reply.insert("count".to_string(), Value::Int(count as i64));
    Ok(respond_success(reply))
}

// ------------------------------------------------------------------------------------------------
// Payload helpers
// ------------------------------------------------------------------------------------------------

fn str_field<'a>(fields: &'a Document, name: &str) -> Result<&'a str, StoreError> {
    match fields.get(name) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(StoreError::BadRequest(format!(
            "'{name}' must be a string, got {}",
            other.type_name()
        ))),
        None => Err(StoreError::BadRequest(format!("missing '{name}'"))),
    }
}

fn database_field(fields: &Document) -> Result<&str, StoreError> {
    match fields.get("database") {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(StoreError::BadRequest(format!(
            "'database' must be a string, got {}",
            other.type_name()
        ))),
        None => Ok(DEFAULT_DATABASE),
    }
}

fn respond_success(reply: Document) -> Outcome {
    match value::pack_document(&reply) {
        Ok(payload) => Outcome::Respond(ResponseType::Success, payload),
        Err(e) => {
            error!(error = %e, "response encode failed");
            Outcome::Close
        }
    }
}

fn respond_not_found() -> Outcome {
    match value::pack_document(&Document::new()) {
        Ok(payload) => Outcome::Respond(ResponseType::NotFound, payload),
        Err(e) => {
            error!(error = %e, "response encode failed");
            Outcome::Close
        }
    }
}

fn respond_error(code: ErrorCode, message: &str, close: bool) -> Outcome {
    let payload = match value::pack_document(&error_payload(code, message)) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "error encode failed");
            return Outcome::Close;
        }
    };
    if close {
        Outcome::RespondAndClose(ResponseType::Error, payload)
    } else {
        Outcome::Respond(ResponseType::Error, payload)
    }
}

fn error_payload(code: ErrorCode, message: &str) -> Document {
    let mut payload = Document::new();
    payload.insert("code".to_string(), Value::Str(code.as_str().to_string()));
    payload.insert("message".to_string(), Value::Str(message.to_string()));
    payload
}

/// Writes an ERROR frame straight to the stream (used by the connection
/// loop for unknown request types).
pub fn write_error(
    writer: &mut impl Write,
    code: ErrorCode,
    message: &str,
) -> Result<(), protocol::ProtocolError> {
    let payload = value::pack_document(&error_payload(code, message))?;
    protocol::write_frame(writer, ResponseType::Error as u8, &payload)
}

/// Maps a store failure to its wire code and whether the connection
/// should be aborted afterwards.
fn classify(e: &StoreError) -> (ErrorCode, bool) {
    match e {
        StoreError::BadRequest(_) => (ErrorCode::BadRequest, false),
        StoreError::NotFound(_) => (ErrorCode::NotFound, false),
        StoreError::AlreadyExists(_) => (ErrorCode::AlreadyExists, false),
        StoreError::DimensionMismatch { .. } => (ErrorCode::DimensionMismatch, false),
        StoreError::Storage(EngineError::Internal(_)) => (ErrorCode::Internal, true),
        StoreError::Storage(_) => (ErrorCode::StorageIo, false),
        StoreError::Catalog(_) | StoreError::Encoding(_) | StoreError::Internal(_) => {
            (ErrorCode::Internal, true)
        }
    }
}
