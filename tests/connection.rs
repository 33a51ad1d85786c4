//! End-to-end tests over a real WebSocket

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chat_relay::{handle_connection, ChatState, Config, Message, MessageKind, Outbound, User};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(config: Config) -> (SocketAddr, ChatState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let chat = ChatState::start(config).await.unwrap();

    let accept_chat = chat.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_connection(stream, accept_chat.clone()));
        }
    });

    (addr, chat)
}

async fn connect(addr: SocketAddr) -> Socket {
    let url = format!("ws://{}/connect", addr);
    let (socket, _) = connect_async(url.as_str()).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, msg: &Message) {
    let json = serde_json::to_string(msg).unwrap();
    socket.send(WsMessage::Text(json.into())).await.unwrap();
}

async fn next_message(socket: &mut Socket) -> Message {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_hello_welcome_and_echo() {
    let (addr, _chat) = start_server(Config::default()).await;
    let mut socket = connect(addr).await;
    let alice = User::new("alice", "a@x.com");

    // Raw JSON, as a browser would send it.
    socket
        .send(WsMessage::Text(
            r#"{"Type":0,"User":{"Name":"","Email":""},"Text":"alice\na@x.com"}"#.into(),
        ))
        .await
        .unwrap();

    let ack = next_message(&mut socket).await;
    assert_eq!(ack.kind, MessageKind::AuthAck);
    assert_eq!(ack.user, alice);
    for _ in 0..2 {
        let greeting = next_message(&mut socket).await;
        assert_eq!(greeting.kind, MessageKind::Text);
        assert_eq!(greeting.user.name, "bot");
    }
    assert_eq!(next_message(&mut socket).await.text, "entered chat");

    send(&mut socket, &Message::text(User::default(), "hi")).await;

    assert_eq!(next_message(&mut socket).await, Message::text(alice, "hi"));
}

#[tokio::test]
async fn test_disconnect_notifies_and_frees_name() {
    let (addr, chat) = start_server(Config::default()).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    send(&mut alice, &Message::new(MessageKind::Hello, User::default(), "alice")).await;
    for _ in 0..4 {
        next_message(&mut alice).await;
    }
    send(&mut bob, &Message::new(MessageKind::Hello, User::default(), "bob")).await;
    for _ in 0..4 {
        next_message(&mut bob).await;
    }

    alice.close(None).await.unwrap();

    let farewell = next_message(&mut bob).await;
    assert_eq!(farewell, Message::text(User::new("alice", ""), "left chat"));

    let freed = timeout(WAIT, async {
        loop {
            if chat.room.can_enter(&User::new("alice", "x@y.com")).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(freed.is_ok());
}

#[tokio::test]
async fn test_idle_connection_torn_down() {
    let config = Config {
        idle_timeout: Duration::from_millis(300),
        keepalive_interval: Duration::from_millis(100),
        ..Config::default()
    };
    let (addr, chat) = start_server(config).await;

    // Watches the room without a socket of its own.
    let (observer_tx, mut observer_rx) = mpsc::channel(16);
    let _observer = chat
        .room
        .enter(User::new("observer", ""), observer_tx)
        .await
        .unwrap();

    let mut alice = connect(addr).await;
    send(&mut alice, &Message::new(MessageKind::Hello, User::default(), "alice")).await;
    for _ in 0..4 {
        next_message(&mut alice).await;
    }

    // Alice goes quiet but keeps the socket open.
    let farewell = Message::text(User::new("alice", ""), "left chat");
    let notified = timeout(WAIT, async {
        while let Some(frame) = observer_rx.recv().await {
            if frame == Outbound::Message(farewell.clone()) {
                return true;
            }
        }
        false
    })
    .await;
    assert!(matches!(notified, Ok(true)));

    let freed = timeout(WAIT, async {
        loop {
            if chat.room.can_enter(&User::new("alice", "")).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(freed.is_ok());
    drop(alice);
}

#[tokio::test]
async fn test_unknown_path_refused() {
    let (addr, _chat) = start_server(Config::default()).await;
    let url = format!("ws://{}/elsewhere", addr);

    assert!(connect_async(url.as_str()).await.is_err());
}

#[tokio::test]
async fn test_origin_checked() {
    let config = Config {
        allowed_origins: vec!["https://chat.example".to_string()],
        ..Config::default()
    };
    let (addr, _chat) = start_server(config).await;
    let url = format!("ws://{}/connect", addr);

    // No Origin header at all.
    assert!(connect_async(url.as_str()).await.is_err());
}
