use crate::ami::codec::Fields;
use crate::ami::AmiClient;
use crate::config::AmiConfig;
use crate::event::{EventReceiver, PbxEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TEST_GREETING: &str = "Asterisk Call Manager/5.0.1";
pub const TEST_USERNAME: &str = "admin";
pub const TEST_SECRET: &str = "secret";

/// Builds the response body for an action, `None` leaves it unanswered.
pub type Responder = Arc<dyn Fn(&Fields) -> Option<String> + Send + Sync>;

enum SessionCommand {
    Send(String),
    Close,
}

/// Answers logins with the test credentials and accepts everything else.
pub fn default_responder(action: &Fields) -> Option<String> {
    match action.get("Action") {
        Some("Login") if action.get("Secret") == Some(TEST_SECRET) => {
            Some("Response: Success\r\nMessage: Authentication accepted".to_string())
        }
        Some("Login") => Some("Response: Error\r\nMessage: Authentication failed".to_string()),
        Some("Logoff") => Some("Response: Goodbye\r\nMessage: Thanks for all the fish.".to_string()),
        _ => Some("Response: Success".to_string()),
    }
}

/// In-process stand-in for the switch's manager port.
pub struct MockAmiServer {
    pub port: u16,
    received: Arc<Mutex<Vec<Fields>>>,
    connections: Arc<AtomicUsize>,
    sessions: Arc<Mutex<Vec<mpsc::UnboundedSender<SessionCommand>>>>,
    token: CancellationToken,
}

impl MockAmiServer {
    pub async fn start() -> Self {
        Self::start_with(true, Arc::new(default_responder)).await
    }

    pub async fn start_with(greeting: bool, responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = Self {
            port,
            received: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            sessions: Arc::new(Mutex::new(Vec::new())),
            token: CancellationToken::new(),
        };

        let received = server.received.clone();
        let connections = server.connections.clone();
        let sessions = server.sessions.clone();
        let token = server.token.clone();
        tokio::spawn(async move {
            loop {
                let stream = select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                };
                connections.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                sessions.lock().unwrap().push(tx);
                tokio::spawn(serve_session(
                    stream,
                    greeting,
                    responder.clone(),
                    received.clone(),
                    rx,
                    token.child_token(),
                ));
            }
        });
        server
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Fields> {
        self.received.lock().unwrap().clone()
    }

    pub fn actions_named(&self, name: &str) -> Vec<Fields> {
        self.received()
            .into_iter()
            .filter(|a| a.get("Action") == Some(name))
            .collect()
    }

    /// Write an event block on the most recent connection.
    pub fn push_event(&self, fields: &[(&str, &str)]) {
        let mut block = String::new();
        for (key, value) in fields {
            block.push_str(&format!("{}: {}\r\n", key, value));
        }
        block.push_str("\r\n");
        self.command(SessionCommand::Send(block));
    }

    /// Drop the most recent connection from the server side.
    pub fn kick(&self) {
        self.command(SessionCommand::Close);
    }

    fn command(&self, command: SessionCommand) {
        if let Some(session) = self.sessions.lock().unwrap().last() {
            session.send(command).ok();
        }
    }
}

impl Drop for MockAmiServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn serve_session(
    stream: TcpStream,
    greeting: bool,
    responder: Responder,
    received: Arc<Mutex<Vec<Fields>>>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    token: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    if greeting {
        let line = format!("{}\r\n", TEST_GREETING);
        if write_half.write_all(line.as_bytes()).await.is_err() {
            return;
        }
    }
    let mut lines = BufReader::new(read_half).lines();
    let mut current = Fields::new();
    loop {
        select! {
            _ = token.cancelled() => break,
            command = commands.recv() => match command {
                Some(SessionCommand::Send(block)) => {
                    if write_half.write_all(block.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(SessionCommand::Close) | None => break,
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    break;
                };
                if !line.is_empty() {
                    if let Some((key, value)) = line.split_once(':') {
                        current.push(key.trim(), value.trim());
                    }
                    continue;
                }
                let action = std::mem::take(&mut current);
                received.lock().unwrap().push(action.clone());
                let Some(body) = responder(&action) else {
                    continue;
                };
                let mut reply = format!("{}\r\n", body);
                if let Some(id) = action.get("ActionID") {
                    reply.push_str(&format!("ActionID: {}\r\n", id));
                }
                reply.push_str("\r\n");
                if write_half.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

pub fn test_config(port: u16) -> AmiConfig {
    AmiConfig {
        host: "127.0.0.1".to_string(),
        port,
        username: TEST_USERNAME.to_string(),
        secret: TEST_SECRET.to_string(),
        extensions: vec!["100".to_string(), "101".to_string(), "102".to_string()],
        reconnect_interval_secs: 1,
        action_timeout_secs: 1,
        login_timeout_secs: 1,
        originate_timeout_secs: 2,
        ended_call_grace_secs: 1,
        ..Default::default()
    }
}

pub async fn connected_client(server: &MockAmiServer) -> AmiClient {
    let client = AmiClient::builder()
        .with_config(test_config(server.port))
        .build();
    client.initialize().await.unwrap();
    client
}

/// Poll `check` until it holds or `within` elapses.
pub async fn wait_until<F: Fn() -> bool>(check: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Next event called `name`, skipping others.
pub async fn recv_event(rx: &mut EventReceiver, name: &str, within: Duration) -> Option<PbxEvent> {
    tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Ok(event) if event.name() == name => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Newchannel block for a trunk call ringing extension 100.
pub fn trunk_channel(call_id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("Event", "Newchannel".to_string()),
        ("Channel", format!("PJSIP/trunk-{}", call_id)),
        ("ChannelState", "4".to_string()),
        ("ChannelStateDesc", "Ring".to_string()),
        ("CallerIDNum", "5551234".to_string()),
        ("CallerIDName", "Alice".to_string()),
        ("Exten", "100".to_string()),
        ("Context", "from-trunk".to_string()),
        ("Uniqueid", call_id.to_string()),
    ]
}

pub fn as_pairs<'a>(fields: &'a [(&'a str, String)]) -> Vec<(&'a str, &'a str)> {
    fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
}
