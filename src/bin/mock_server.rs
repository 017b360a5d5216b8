use std::{
    env,
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tungstenite::{accept, Message as WsMessage, WebSocket};

type Db = Arc<Mutex<Connection>>;
type Subscribers = Arc<Mutex<Vec<mpsc::Sender<String>>>>;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Any of `{"fetch": true}`, `{"reset": true}`, `{"dismiss": "<id>"}`.
#[derive(Debug, Deserialize)]
struct ClientCommand {
    #[serde(default)]
    fetch: bool,
    #[serde(default)]
    reset: bool,
    dismiss: Option<String>,
}

struct Notification {
    uuid: String,
    message: String,
    tags: Vec<String>,
    payload: Value,
    sent_at: f64,
}

impl Notification {
    fn to_wire(&self) -> Value {
        json!([self.message, self.tags, self.payload, self.sent_at, self.uuid])
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn next_uuid() -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:04x}", now_seconds() as u64, seq)
}

fn seed_notifications() -> Vec<(&'static str, Vec<&'static str>, Value)> {
    vec![
        (
            "Import of <b>plate-reader.xlsx</b> finished",
            vec!["import"],
            json!({"lines_created": 24}),
        ),
        (
            "Study <i>Ethanol tolerance</i> was shared with you",
            vec!["study", "permission"],
            json!({"study": 12}),
        ),
        ("Export ready for download", vec!["export"], json!({"file": "export.csv"})),
    ]
}

fn ensure_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            message TEXT NOT NULL,
            tags TEXT NOT NULL,
            payload TEXT NOT NULL,
            sent_at REAL NOT NULL,
            read INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    Ok(())
}

fn insert_notification(
    conn: &Connection,
    message: &str,
    tags: &[&str],
    payload: &Value,
) -> Result<Notification, rusqlite::Error> {
    let notification = Notification {
        uuid: next_uuid(),
        message: message.to_string(),
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
        payload: payload.clone(),
        sent_at: now_seconds(),
    };
    conn.execute(
        "INSERT INTO notifications (uuid, message, tags, payload, sent_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            notification.uuid,
            notification.message,
            Value::from(notification.tags.clone()).to_string(),
            notification.payload.to_string(),
            notification.sent_at
        ],
    )?;
    Ok(notification)
}

fn seed_if_empty(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))?;
    if count == 0 {
        let tx = conn.transaction()?;
        for (message, tags, payload) in seed_notifications() {
            insert_notification(&tx, message, &tags, &payload)?;
        }
        tx.commit()?;
    }
    Ok(())
}

fn load_unread(conn: &Connection) -> Result<Vec<Notification>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT uuid, message, tags, payload, sent_at FROM notifications WHERE read = 0 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let tags: String = row.get(2)?;
        let payload: String = row.get(3)?;
        Ok(Notification {
            uuid: row.get(0)?,
            message: row.get(1)?,
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            sent_at: row.get(4)?,
        })
    })?;

    let mut notifications = Vec::new();
    for notification in rows {
        notifications.push(notification?);
    }
    Ok(notifications)
}

fn unread_count(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM notifications WHERE read = 0", [], |row| row.get(0))
}

fn messages_payload(notifications: &[Notification], unread: i64) -> String {
    let messages: Vec<Value> = notifications.iter().map(Notification::to_wire).collect();
    json!({ "messages": messages, "unread": unread }).to_string()
}

fn broadcast_text(subscribers: &Subscribers, text: &str) {
    if let Ok(mut list) = subscribers.lock() {
        list.retain(|sender| sender.send(text.to_string()).is_ok());
    }
}

/// Applies one client command, returning a frame for the caller only and
/// a frame for every connected client.
fn handle_command(
    db: &Db,
    command: ClientCommand,
) -> Result<(Option<String>, Option<String>), rusqlite::Error> {
    let conn = match db.lock() {
        Ok(conn) => conn,
        Err(poisoned) => poisoned.into_inner(),
    };

    if command.reset {
        conn.execute("UPDATE notifications SET read = 1 WHERE read = 0", [])?;
        return Ok((None, Some(json!({ "reset": true }).to_string())));
    }
    if let Some(uuid) = command.dismiss {
        conn.execute("UPDATE notifications SET read = 1 WHERE uuid = ?1", params![uuid])?;
        let unread = unread_count(&conn)?;
        return Ok((None, Some(json!({ "dismiss": uuid, "unread": unread }).to_string())));
    }
    if command.fetch {
        let unread = load_unread(&conn)?;
        let count = unread.len() as i64;
        return Ok((Some(messages_payload(&unread, count)), None));
    }
    Ok((None, None))
}

fn spawn_generator(db: Db, subscribers: Subscribers, interval: Duration) {
    thread::spawn(move || {
        let mut tick: u64 = 0;
        loop {
            thread::sleep(interval);
            tick += 1;
            let frame = {
                let conn = match db.lock() {
                    Ok(conn) => conn,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let payload = json!({ "build": tick });
                let text = format!("Build #{tick} finished");
                insert_notification(&conn, &text, &["build"], &payload).and_then(|notification| {
                    unread_count(&conn).map(|unread| messages_payload(&[notification], unread))
                })
            };
            match frame {
                Ok(frame) => broadcast_text(&subscribers, &frame),
                Err(err) => warn!("generator insert failed: {err}"),
            }
        }
    });
}

fn serve_connection(mut socket: WebSocket<TcpStream>, db: Db, subscribers: Subscribers) {
    let (tx, rx) = mpsc::channel::<String>();
    if let Ok(mut list) = subscribers.lock() {
        list.push(tx);
    }

    thread::spawn(move || loop {
        match socket.read() {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => {
                    debug!(?command, "client command");
                    match handle_command(&db, command) {
                        Ok((reply, broadcast)) => {
                            if let Some(reply) = reply {
                                if socket.send(WsMessage::Text(reply)).is_err() {
                                    return;
                                }
                            }
                            if let Some(broadcast) = broadcast {
                                broadcast_text(&subscribers, &broadcast);
                            }
                        }
                        Err(err) => warn!("command failed: {err}"),
                    }
                }
                Err(err) => warn!("ignoring bad client frame: {err}"),
            },
            Ok(WsMessage::Close(_)) => return,
            Ok(_) => {}
            Err(err) => {
                let io_blocked = matches!(
                    err,
                    tungstenite::Error::Io(ref io_err)
                        if io_err.kind() == std::io::ErrorKind::WouldBlock
                );
                if !io_blocked {
                    return;
                }
            }
        }

        while let Ok(payload) = rx.try_recv() {
            if socket.send(WsMessage::Text(payload)).is_err() {
                return;
            }
        }

        thread::sleep(Duration::from_millis(8));
    });
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr = env::var("MOCK_NOTIFY_ADDR").unwrap_or_else(|_| "127.0.0.1:9001".to_string());
    let db_path = env::var("MOCK_NOTIFY_DB").unwrap_or_else(|_| "mock_notify.db".to_string());
    let interval = env::var("MOCK_NOTIFY_INTERVAL_SECS")
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(15));

    let mut conn = Connection::open(&db_path)?;
    ensure_schema(&conn)?;
    seed_if_empty(&mut conn)?;
    let db: Db = Arc::new(Mutex::new(conn));

    let listener = TcpListener::bind(&addr)?;
    info!("mock notification server listening on ws://{addr}/ws/notify/");

    let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
    spawn_generator(Arc::clone(&db), Arc::clone(&subscribers), interval);

    for stream in listener.incoming() {
        let stream = stream?;
        let peer = stream.peer_addr().ok();
        let socket = match accept(stream) {
            Ok(socket) => socket,
            Err(err) => {
                warn!("handshake failed: {err}");
                continue;
            }
        };
        let _ = socket.get_ref().set_nonblocking(true);
        info!(?peer, "client connected");
        serve_connection(socket, Arc::clone(&db), Arc::clone(&subscribers));
    }

    Ok(())
}
