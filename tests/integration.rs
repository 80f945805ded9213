//! End-to-end scenarios over a real TCP connection.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use nexadb::config::Config;
use nexadb::protocol::{HEADER_SIZE, MAGIC, RequestType, ResponseType, VERSION};
use nexadb::server::Server;
use nexadb::store::Store;
use nexadb::value::{self, Document, Value};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Harness
// ------------------------------------------------------------------------------------------------

struct TestServer {
    addr: SocketAddr,
    store: Arc<Store>,
}

fn start_server(dir: &std::path::Path, auth_required: bool) -> TestServer {
    let config = Config {
        data_dir: dir.to_path_buf(),
        auth_required,
        ..Config::default()
    };
    let store = Arc::new(Store::open(config).expect("open store"));

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let server_store = Arc::clone(&store);
    std::thread::spawn(move || {
        let _ = Server::new(server_store).serve(listener);
    });

    TestServer { addr, store }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self { stream }
    }

    fn send_raw(&mut self, frame_type: u8, payload: &[u8]) {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        header[4] = VERSION;
        header[5] = frame_type;
        header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        self.stream.write_all(&header).expect("write header");
        self.stream.write_all(payload).expect("write payload");
    }

    fn read_response(&mut self) -> (u8, Document) {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header).expect("read header");
        assert_eq!(&header[0..4], &MAGIC.to_be_bytes(), "response magic");
        let frame_type = header[5];
        let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).expect("read payload");
        let fields = if payload.is_empty() {
            Document::new()
        } else {
            value::unpack_document(&payload).expect("decode payload")
        };
        (frame_type, fields)
    }

    fn request(&mut self, request: RequestType, fields: Document) -> (u8, Document) {
        let payload = value::pack_document(&fields).expect("encode payload");
        self.send_raw(request as u8, &payload);
        self.read_response()
    }

    fn authenticate(&mut self, username: &str, password: &str) -> (u8, Document) {
        let mut fields = Document::new();
        fields.insert("username".to_string(), Value::Str(username.to_string()));
        fields.insert("password".to_string(), Value::Str(password.to_string()));
        self.request(RequestType::Connect, fields)
    }
}

fn doc_fields(collection: &str, data: Document) -> Document {
    let mut fields = Document::new();
    fields.insert("collection".to_string(), Value::Str(collection.to_string()));
    fields.insert("data".to_string(), Value::Map(data));
    fields
}

fn key_fields(collection: &str, key: &str) -> Document {
    let mut fields = Document::new();
    fields.insert("collection".to_string(), Value::Str(collection.to_string()));
    fields.insert("key".to_string(), Value::Str(key.to_string()));
    fields
}

const SUCCESS: u8 = ResponseType::Success as u8;
const ERROR: u8 = ResponseType::Error as u8;
const NOT_FOUND: u8 = ResponseType::NotFound as u8;
const PONG: u8 = ResponseType::Pong as u8;

// ------------------------------------------------------------------------------------------------
// Scenarios
// ------------------------------------------------------------------------------------------------

#[test]
fn ping_pong() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);
    let mut client = Client::connect(server.addr);

    let (response, _) = client.request(RequestType::Ping, Document::new());
    assert_eq!(response, PONG);
    server.store.close().unwrap();
}

#[test]
fn insert_read_update_delete_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);
    let mut client = Client::connect(server.addr);

    // CREATE {collection:"users", data:{_id:"u1", name:"Alice"}}
    let mut data = Document::new();
    data.insert("_id".to_string(), Value::Str("u1".into()));
    data.insert("name".to_string(), Value::Str("Alice".into()));
    let (response, fields) = client.request(RequestType::Create, doc_fields("users", data));
    assert_eq!(response, SUCCESS);
    assert_eq!(fields.get("_id"), Some(&Value::Str("u1".into())));

    // READ → the document
    let (response, fields) = client.request(RequestType::Read, key_fields("users", "u1"));
    assert_eq!(response, SUCCESS);
    let Some(Value::Map(document)) = fields.get("document") else {
        panic!("missing document");
    };
    assert_eq!(document.get("name"), Some(&Value::Str("Alice".into())));

    // UPDATE {updates:{age:30}}
    let mut fields = key_fields("users", "u1");
    let mut updates = Document::new();
    updates.insert("age".to_string(), Value::Int(30));
    fields.insert("updates".to_string(), Value::Map(updates));
    let (response, _) = client.request(RequestType::Update, fields);
    assert_eq!(response, SUCCESS);

    // READ → merged document
    let (response, fields) = client.request(RequestType::Read, key_fields("users", "u1"));
    assert_eq!(response, SUCCESS);
    let Some(Value::Map(document)) = fields.get("document") else {
        panic!("missing document");
    };
    assert_eq!(document.get("name"), Some(&Value::Str("Alice".into())));
    assert_eq!(document.get("age"), Some(&Value::Int(30)));

    // DELETE → SUCCESS; READ → NOT_FOUND
    let (response, _) = client.request(RequestType::Delete, key_fields("users", "u1"));
    assert_eq!(response, SUCCESS);
    let (response, _) = client.request(RequestType::Read, key_fields("users", "u1"));
    assert_eq!(response, NOT_FOUND);

    // DELETE of a missing key reports NOT_FOUND.
    let (response, _) = client.request(RequestType::Delete, key_fields("users", "u1"));
    assert_eq!(response, NOT_FOUND);

    server.store.close().unwrap();
}

#[test]
fn range_scan_query() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);
    let mut client = Client::connect(server.addr);

    for i in 0..100 {
        let mut data = Document::new();
        data.insert("_id".to_string(), Value::Str(format!("user{i:010}")));
        let (response, _) = client.request(RequestType::Create, doc_fields("users", data));
        assert_eq!(response, SUCCESS);
    }

    let mut fields = Document::new();
    fields.insert("collection".to_string(), Value::Str("users".into()));
    let mut id_ops = BTreeMap::new();
    id_ops.insert("$gte".to_string(), Value::Str("user0000000050".into()));
    let mut filters = BTreeMap::new();
    filters.insert("_id".to_string(), Value::Map(id_ops));
    fields.insert("filters".to_string(), Value::Map(filters));
    fields.insert("limit".to_string(), Value::Int(5));

    let (response, fields) = client.request(RequestType::Query, fields);
    assert_eq!(response, SUCCESS);
    let Some(Value::List(documents)) = fields.get("documents") else {
        panic!("missing documents");
    };
    let ids: Vec<&str> = documents
        .iter()
        .map(|d| d.as_map().unwrap().get("_id").unwrap().as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        vec![
            "user0000000050",
            "user0000000051",
            "user0000000052",
            "user0000000053",
            "user0000000054"
        ]
    );

    server.store.close().unwrap();
}

#[test]
fn batch_write_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);
    let mut client = Client::connect(server.addr);

    let ops: Vec<Value> = (0..10)
        .map(|i| {
            let mut op = Document::new();
            op.insert("kind".to_string(), Value::Str("put".into()));
            op.insert("key".to_string(), Value::Str(format!("k{i}")));
            let mut data = Document::new();
            data.insert("n".to_string(), Value::Int(i));
            op.insert("data".to_string(), Value::Map(data));
            Value::Map(op)
        })
        .collect();

    let mut fields = Document::new();
    fields.insert("collection".to_string(), Value::Str("items".into()));
    fields.insert("ops".to_string(), Value::List(ops));
    let (response, fields) = client.request(RequestType::BatchWrite, fields);
    assert_eq!(response, SUCCESS);
    assert_eq!(fields.get("count"), Some(&Value::Int(10)));

    for i in 0..10 {
        let (response, _) = client.request(RequestType::Read, key_fields("items", &format!("k{i}")));
        assert_eq!(response, SUCCESS, "k{i}");
    }

    server.store.close().unwrap();
}

#[test]
fn vector_search_over_the_wire() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);
    server
        .store
        .create_collection(
            "default",
            "embeddings",
            Some(4),
            nexadb::vector::Metric::SquaredL2,
            nexadb::vector::IndexKind::Hnsw,
        )
        .unwrap();

    let mut client = Client::connect(server.addr);

    for (id, vector) in [
        ("near", [0.1f32, 0.0, 0.0, 0.0]),
        ("mid", [1.0, 1.0, 0.0, 0.0]),
        ("far", [9.0, 9.0, 9.0, 9.0]),
    ] {
        let mut data = Document::new();
        data.insert("_id".to_string(), Value::Str(id.to_string()));
        data.insert(
            "vector".to_string(),
            Value::List(vector.iter().map(|&v| Value::Float(v as f64)).collect()),
        );
        let (response, _) = client.request(RequestType::Create, doc_fields("embeddings", data));
        assert_eq!(response, SUCCESS, "{id}");
    }

    let mut fields = Document::new();
    fields.insert("collection".to_string(), Value::Str("embeddings".into()));
    fields.insert(
        "vector".to_string(),
        Value::List(vec![
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(0.0),
        ]),
    );
    fields.insert("k".to_string(), Value::Int(2));

    let (response, fields) = client.request(RequestType::VectorSearch, fields);
    assert_eq!(response, SUCCESS);
    let Some(Value::List(results)) = fields.get("results") else {
        panic!("missing results");
    };
    assert_eq!(results.len(), 2);

    let first = results[0].as_map().unwrap();
    assert_eq!(first.get("_id").unwrap().as_str(), Some("near"));
    assert!(first.get("distance").unwrap().as_f64().is_some());
    assert!(matches!(first.get("document"), Some(Value::Map(_))));

    // Wrong dimension is a client error; the connection stays usable.
    let mut fields = Document::new();
    fields.insert("collection".to_string(), Value::Str("embeddings".into()));
    fields.insert(
        "vector".to_string(),
        Value::List(vec![Value::Float(0.0); 3]),
    );
    let (response, fields) = client.request(RequestType::VectorSearch, fields);
    assert_eq!(response, ERROR);
    assert_eq!(
        fields.get("code"),
        Some(&Value::Str("DIMENSION_MISMATCH".into()))
    );
    let (response, _) = client.request(RequestType::Ping, Document::new());
    assert_eq!(response, PONG);

    server.store.close().unwrap();
}

#[test]
fn durability_across_restart() {
    let tmp = TempDir::new().unwrap();

    {
        let server = start_server(tmp.path(), false);
        let mut client = Client::connect(server.addr);
        for i in 0..200 {
            let mut data = Document::new();
            data.insert("_id".to_string(), Value::Str(format!("d{i:04}")));
            data.insert("payload".to_string(), Value::Int(i));
            let (response, _) = client.request(RequestType::Create, doc_fields("docs", data));
            assert_eq!(response, SUCCESS);
        }
        server.store.close().unwrap();
    }

    // Fresh store + server on the same directory: every acknowledged
    // write is visible.
    let server = start_server(tmp.path(), false);
    let mut client = Client::connect(server.addr);
    for i in 0..200 {
        let (response, fields) =
            client.request(RequestType::Read, key_fields("docs", &format!("d{i:04}")));
        assert_eq!(response, SUCCESS, "d{i:04}");
        let document = fields.get("document").unwrap().as_map().unwrap();
        assert_eq!(document.get("payload"), Some(&Value::Int(i)));
    }
    server.store.close().unwrap();
}

#[test]
fn two_connections_disjoint_keys() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);

    let run_client = |prefix: &'static str, addr: SocketAddr| {
        std::thread::spawn(move || {
            let mut client = Client::connect(addr);
            for i in 0..500 {
                let id = format!("{prefix}{i:04}");
                let mut data = Document::new();
                data.insert("_id".to_string(), Value::Str(id.clone()));
                data.insert("owner".to_string(), Value::Str(prefix.to_string()));
                let (response, _) =
                    client.request(RequestType::Create, doc_fields("shared", data));
                assert_eq!(response, SUCCESS, "{id}");

                // Read-your-writes on the same connection.
                let (response, fields) =
                    client.request(RequestType::Read, key_fields("shared", &id));
                assert_eq!(response, SUCCESS, "{id}");
                let document = fields.get("document").unwrap().as_map().unwrap();
                assert_eq!(document.get("owner"), Some(&Value::Str(prefix.to_string())));
            }
        })
    };

    let a = run_client("alpha-", server.addr);
    let b = run_client("beta-", server.addr);
    a.join().unwrap();
    b.join().unwrap();

    // Exactly 1000 live documents afterwards.
    let mut client = Client::connect(server.addr);
    let mut fields = Document::new();
    fields.insert("collection".to_string(), Value::Str("shared".into()));
    let (response, fields) = client.request(RequestType::Query, fields);
    assert_eq!(response, SUCCESS);
    let Some(Value::List(documents)) = fields.get("documents") else {
        panic!("missing documents");
    };
    assert_eq!(documents.len(), 1000);

    server.store.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Auth and framing violations
// ------------------------------------------------------------------------------------------------

#[test]
fn authentication_gates_requests() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), true);
    server.store.add_user("tester", "pw").unwrap();

    // Unauthenticated request → UNAUTHENTICATED error, connection open.
    let mut client = Client::connect(server.addr);
    let (response, fields) = client.request(RequestType::Ping, Document::new());
    assert_eq!(response, ERROR);
    assert_eq!(
        fields.get("code"),
        Some(&Value::Str("UNAUTHENTICATED".into()))
    );

    // CONNECT with good credentials on the same socket, then serve.
    let (response, _) = client.authenticate("tester", "pw");
    assert_eq!(response, SUCCESS);
    let (response, _) = client.request(RequestType::Ping, Document::new());
    assert_eq!(response, PONG);

    server.store.close().unwrap();
}

#[test]
fn bad_credentials_close_the_connection() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), true);
    server.store.add_user("tester", "pw").unwrap();

    let mut client = Client::connect(server.addr);
    let (response, fields) = client.authenticate("tester", "wrong");
    assert_eq!(response, ERROR);
    assert_eq!(
        fields.get("code"),
        Some(&Value::Str("UNAUTHENTICATED".into()))
    );

    // No subsequent request is served on this socket. The server may
    // have already closed its end, so the write itself is allowed to
    // fail (broken pipe / reset) as further evidence of closure.
    let payload = value::pack_document(&Document::new()).unwrap();
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    header[4] = VERSION;
    header[5] = RequestType::Ping as u8;
    header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    let _ = client.stream.write_all(&header);
    let _ = client.stream.write_all(&payload);
    let mut byte = [0u8; 1];
    match client.stream.read(&mut byte) {
        Ok(0) => {}                // clean close
        Ok(_) => panic!("server answered after failed auth"),
        Err(_) => {}               // reset also acceptable
    }

    server.store.close().unwrap();
}

#[test]
fn wrong_magic_closes_immediately() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(b"JUNK");
    header[4] = VERSION;
    header[5] = RequestType::Ping as u8;
    stream.write_all(&header).unwrap();

    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => {}
        Ok(_) => panic!("server answered a bad-magic frame"),
        Err(_) => {}
    }

    server.store.close().unwrap();
}

#[test]
fn wrong_version_closes_immediately() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    header[4] = 99;
    header[5] = RequestType::Ping as u8;
    stream.write_all(&header).unwrap();

    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => {}
        Ok(_) => panic!("server answered a bad-version frame"),
        Err(_) => {}
    }

    server.store.close().unwrap();
}

#[test]
fn create_conflict_reports_already_exists() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);
    let mut client = Client::connect(server.addr);

    let mut data = Document::new();
    data.insert("_id".to_string(), Value::Str("dup".into()));
    let (response, _) = client.request(RequestType::Create, doc_fields("users", data.clone()));
    assert_eq!(response, SUCCESS);

    let (response, fields) = client.request(RequestType::Create, doc_fields("users", data));
    assert_eq!(response, ERROR);
    assert_eq!(
        fields.get("code"),
        Some(&Value::Str("ALREADY_EXISTS".into()))
    );

    server.store.close().unwrap();
}

#[test]
fn unknown_query_operator_is_bad_request() {
    let tmp = TempDir::new().unwrap();
    let server = start_server(tmp.path(), false);
    let mut client = Client::connect(server.addr);

    let mut data = Document::new();
    data.insert("_id".to_string(), Value::Str("x".into()));
    client.request(RequestType::Create, doc_fields("users", data));

    let mut op = BTreeMap::new();
    op.insert("$nope".to_string(), Value::Int(1));
    let mut filters = BTreeMap::new();
    filters.insert("n".to_string(), Value::Map(op));
    let mut fields = Document::new();
    fields.insert("collection".to_string(), Value::Str("users".into()));
    fields.insert("filters".to_string(), Value::Map(filters));

    let (response, fields) = client.request(RequestType::Query, fields);
    assert_eq!(response, ERROR);
    assert_eq!(fields.get("code"), Some(&Value::Str("BAD_REQUEST".into())));

    server.store.close().unwrap();
}
