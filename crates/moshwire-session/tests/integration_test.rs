//! moshwire-session 統合テスト
//!
//! crypto + transport + SSP + stream の完全なパイプラインを、
//! クライアントとサーバーの 2 つのセッションで動かす。
//! メモリ上のチャンネルでは tokio の時刻を止めて決定的に進める。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Level;

use moshwire_crypto::{CryptoSession, Direction, MoshKey};
use moshwire_proto::Instruction;
use moshwire_session::{
    DatagramChannel, MemoryChannel, Received, Session, SessionConfig, SessionError, StreamSession,
    UdpChannel,
};
use moshwire_stream::StreamState;
use moshwire_transport::encode_fragments;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

// ==============================================================
// ヘルパー
// ==============================================================

const KEY_B64: &str = "4NeCCgvZFe2RnPgrcU1PQw";

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 1], port))
}

fn key() -> MoshKey {
    MoshKey::from_base64(KEY_B64).unwrap()
}

type MemorySession = Arc<StreamSession<MemoryChannel>>;

/// クライアント (port 1) とサーバー (port 2) をつないだセッションの組
fn connected_pair() -> (MemorySession, MemorySession) {
    let (c, s) = MemoryChannel::pair(addr(1), addr(2));
    let client = Session::client(c, StreamState::new(), key(), addr(2), SessionConfig::default());
    let server = Session::server(s, StreamState::new(), key(), SessionConfig::default());
    (Arc::new(client), Arc::new(server))
}

fn spawn_run<C>(session: &Arc<StreamSession<C>>) -> JoinHandle<Result<(), SessionError>>
where
    C: DatagramChannel + 'static,
{
    let session = Arc::clone(session);
    tokio::spawn(async move { session.run().await })
}

/// `len` バイト受け取るか `limit` が過ぎるまで受信データを集める
async fn read_until<C>(session: &StreamSession<C>, len: usize, limit: Duration) -> Vec<u8>
where
    C: DatagramChannel,
{
    let deadline = Instant::now() + limit;
    let mut out = Vec::new();
    while out.len() < len && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
        out.extend(session.with_state(|stream| stream.read_available()).await);
    }
    out
}

/// 送信 `every` 回ごとに 1 回捨てるフィルター
fn drop_every(every: usize) -> impl FnMut(&[u8]) -> bool + Send + 'static {
    let mut count = 0;
    move |_| {
        count += 1;
        count % every == 0
    }
}

/// 決定的な疑似乱数バイト列（zlib でほとんど縮まない）
fn noise(len: usize) -> Vec<u8> {
    let mut x: u32 = 0x9E37_79B9;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

async fn join(handle: JoinHandle<Result<(), SessionError>>, limit: Duration) {
    tokio::time::timeout(limit, handle)
        .await
        .expect("session loop did not finish")
        .expect("session task panicked")
        .expect("session loop failed");
}

// ==============================================================
// エンドツーエンド
// ==============================================================

/// "ls\n" を送り、出力を受け取り、シャットダウンの握手で両側が終了する
#[tokio::test(start_paused = true)]
async fn test_ls_round_trip_and_shutdown() {
    let (client, server) = connected_pair();
    let client_loop = spawn_run(&client);
    let server_loop = spawn_run(&server);

    client.update_local(|stream| stream.write(b"ls\n")).await;
    assert_eq!(read_until(&server, 3, Duration::from_secs(5)).await, b"ls\n");

    server
        .update_local(|stream| stream.write(b"Cargo.toml\nsrc\n"))
        .await;
    assert_eq!(
        read_until(&client, 15, Duration::from_secs(5)).await,
        b"Cargo.toml\nsrc\n"
    );

    client.start_shutdown().await;
    join(client_loop, Duration::from_secs(10)).await;
    join(server_loop, Duration::from_secs(10)).await;

    assert!(client.shutdown_acknowledged().await);
    assert!(!client.shutdown_timed_out().await);
    assert!(server.peer_shutdown().await);

    let stats = server.stats().await;
    assert_eq!(stats.datagrams_discarded, 0);
    assert_eq!(stats.remote_state_num, u64::MAX);
}

/// 何度も書き込んでも、順序どおり一度ずつ届く
#[tokio::test(start_paused = true)]
async fn test_many_small_writes_arrive_in_order() {
    let (client, server) = connected_pair();
    let _client_loop = spawn_run(&client);
    let _server_loop = spawn_run(&server);

    let mut expected = Vec::new();
    for i in 0..20 {
        let line = format!("echo {i}\n");
        expected.extend_from_slice(line.as_bytes());
        client.update_local(|stream| stream.write(line.as_bytes())).await;
        tokio::time::sleep(Duration::from_millis(7)).await;
    }

    let received = read_until(&server, expected.len(), Duration::from_secs(10)).await;
    assert_eq!(received, expected);

    // ACK 済みの送信データは解放される
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.with_state(|stream| stream.unacked_len()).await, 0);
}

/// MTU を超える出力は複数の Fragment に分かれて届く
#[tokio::test(start_paused = true)]
async fn test_large_output_spans_fragments() {
    let (client, server) = connected_pair();
    let _client_loop = spawn_run(&client);
    let _server_loop = spawn_run(&server);

    // サーバーの送信先が決まるまで待つ
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.remote_addr().await, Some(addr(1)));

    let output = noise(20_000);
    server.update_local(|stream| stream.write(&output)).await;

    let received = read_until(&client, output.len(), Duration::from_secs(10)).await;
    assert_eq!(received.len(), output.len());
    assert!(received == output);

    let stats = client.stats().await;
    // 20 KB の乱数は 1 つのデータグラムには入らない
    assert!(stats.datagrams_received > 40);
    assert_eq!(stats.datagrams_discarded, 0);
}

/// データグラムの 1/3 が失われても、再送で最新の状態に収束する
#[tokio::test(start_paused = true)]
async fn test_converges_under_loss() {
    let (client, server) = connected_pair();
    client.channel().set_drop_filter(drop_every(3));
    server.channel().set_drop_filter(drop_every(3));
    let _client_loop = spawn_run(&client);
    let _server_loop = spawn_run(&server);

    let mut expected = Vec::new();
    for i in 0..10 {
        let line = format!("key {i}\n");
        expected.extend_from_slice(line.as_bytes());
        client.update_local(|stream| stream.write(line.as_bytes())).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    let received = read_until(&server, expected.len(), Duration::from_secs(30)).await;
    assert_eq!(received, expected);

    server.update_local(|stream| stream.write(b"ok\n")).await;
    assert_eq!(read_until(&client, 3, Duration::from_secs(30)).await, b"ok\n");
}

/// サーバーは最新のパケットの送信元にローミングする
#[tokio::test(start_paused = true)]
async fn test_server_follows_roaming_client() {
    let (client, server) = connected_pair();
    let _client_loop = spawn_run(&client);
    let _server_loop = spawn_run(&server);

    client.update_local(|stream| stream.write(b"before\n")).await;
    assert_eq!(read_until(&server, 7, Duration::from_secs(5)).await, b"before\n");
    assert_eq!(server.remote_addr().await, Some(addr(1)));

    client.channel().set_local_addr(addr(9));
    client.update_local(|stream| stream.write(b"after\n")).await;
    assert_eq!(read_until(&server, 6, Duration::from_secs(5)).await, b"after\n");
    assert_eq!(server.remote_addr().await, Some(addr(9)));

    server.update_local(|stream| stream.write(b"hi\n")).await;
    assert_eq!(read_until(&client, 3, Duration::from_secs(5)).await, b"hi\n");
    assert_eq!(server.channel().last_send_target(), Some(addr(9)));
}

// ==============================================================
// 不正なデータグラム
// ==============================================================

fn heartbeat_fragment() -> Vec<u8> {
    let instr = Instruction::new_heartbeat(0, 0, 0);
    let fragments = encode_fragments(0, &instr.encode_to_bytes(), 400).unwrap();
    fragments[0].to_bytes()
}

/// 壊れた・鍵の違う・方向の違うパケットは捨てて数えるだけ
#[tokio::test(start_paused = true)]
async fn test_bad_datagrams_are_discarded() {
    let (client, server) = connected_pair();
    let raw = client.channel();

    // 短すぎる
    raw.send(addr(2), &[0u8; 5]).await.unwrap();
    // 鍵が違う
    let mut wrong_key = CryptoSession::from_key([9u8; 16], Direction::ToServer);
    raw.send(addr(2), &wrong_key.encrypt_packet(0, u16::MAX, &heartbeat_fragment()).unwrap())
        .await
        .unwrap();
    // サーバー自身の方向（反射）
    let mut reflected = CryptoSession::from_key(*key().as_bytes(), Direction::ToClient);
    raw.send(addr(2), &reflected.encrypt_packet(0, u16::MAX, &heartbeat_fragment()).unwrap())
        .await
        .unwrap();
    for _ in 0..3 {
        assert_eq!(server.receive_once().await.unwrap(), Received::Discarded);
    }
    // 認証できないパケットの送信元にはローミングしない
    assert_eq!(server.remote_addr().await, None);

    // 正しい鍵・方向だが Fragment が壊れている（認証は通るので送信元は採用する）
    let mut garbled = CryptoSession::from_key(*key().as_bytes(), Direction::ToServer);
    raw.send(addr(2), &garbled.encrypt_packet(0, u16::MAX, &[1, 2, 3]).unwrap())
        .await
        .unwrap();
    assert_eq!(server.receive_once().await.unwrap(), Received::Discarded);
    assert_eq!(server.remote_addr().await, Some(addr(1)));

    // 正しいパケットは受け付ける
    let mut good = CryptoSession::from_key(*key().as_bytes(), Direction::ToServer);
    raw.send(addr(2), &good.encrypt_packet(0, u16::MAX, &heartbeat_fragment()).unwrap())
        .await
        .unwrap();
    assert_eq!(
        server.receive_once().await.unwrap(),
        Received::Instruction { remote_state: 0 }
    );

    let stats = server.stats().await;
    assert_eq!(stats.datagrams_received, 5);
    assert_eq!(stats.datagrams_discarded, 4);
    assert_eq!(stats.instructions_received, 1);
}

/// 同じデータグラムの再送（リプレイ）で状態が二重に適用されることはない
#[tokio::test(start_paused = true)]
async fn test_replayed_datagram_is_harmless() {
    let (c, s) = MemoryChannel::pair(addr(1), addr(2));
    let server = Session::server(s, StreamState::new(), key(), SessionConfig::default());

    let instr = Instruction::new_send(0, 1, 0, 0, b"once".to_vec());
    let fragment = encode_fragments(0, &instr.encode_to_bytes(), 400).unwrap()[0].to_bytes();
    let mut crypto = CryptoSession::from_key(*key().as_bytes(), Direction::ToServer);
    let packet = crypto.encrypt_packet(0, u16::MAX, &fragment).unwrap();

    c.send(addr(2), &packet).await.unwrap();
    c.send(addr(2), &packet).await.unwrap();
    assert_eq!(server.receive_once().await.unwrap(), Received::Instruction { remote_state: 1 });
    assert_eq!(server.receive_once().await.unwrap(), Received::Instruction { remote_state: 1 });

    assert_eq!(server.with_state(|stream| stream.read_available()).await, b"once");
}

// ==============================================================
// 生存監視と終了
// ==============================================================

/// 相手がいなければシャットダウンは再送上限で打ち切られる
#[tokio::test(start_paused = true)]
async fn test_shutdown_times_out_without_peer() {
    let (c, s) = MemoryChannel::pair(addr(1), addr(2));
    drop(s);
    let client = Session::client(c, StreamState::new(), key(), addr(2), SessionConfig::default());

    client.start_shutdown().await;
    tokio::time::timeout(Duration::from_secs(60), client.run())
        .await
        .unwrap()
        .unwrap();

    assert!(client.shutdown_timed_out().await);
    assert!(!client.shutdown_acknowledged().await);
    assert_eq!(client.stats().await.datagrams_sent, 16);
}

/// ACK が 10 秒届かなければ接続断と報告する
#[tokio::test(start_paused = true)]
async fn test_connection_timeout_reported() {
    let (c, s) = MemoryChannel::pair(addr(1), addr(2));
    drop(s);
    let client = Session::client(c, StreamState::new(), key(), addr(2), SessionConfig::default());

    client.tick().await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(!client.connection_timed_out().await);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(client.connection_timed_out().await);
}

/// 相手から何か届けば接続断ではない
#[tokio::test(start_paused = true)]
async fn test_live_peer_keeps_connection_alive() {
    let (client, server) = connected_pair();
    let _client_loop = spawn_run(&client);
    let _server_loop = spawn_run(&server);

    // キープアライブだけで 30 秒
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!client.connection_timed_out().await);
    assert!(!server.connection_timed_out().await);
}

/// クローズすると受信タイムアウト以内にループが戻る
#[tokio::test(start_paused = true)]
async fn test_close_stops_run_loop() {
    let (client, server) = connected_pair();
    let client_loop = spawn_run(&client);
    let server_loop = spawn_run(&server);

    tokio::time::sleep(Duration::from_secs(1)).await;
    server.close();
    client.close();

    join(server_loop, Duration::from_millis(300)).await;
    join(client_loop, Duration::from_millis(300)).await;
    assert!(!server.is_open());
}

// ==============================================================
// 統計と実 UDP
// ==============================================================

#[tokio::test(start_paused = true)]
async fn test_stats_json() {
    let (client, server) = connected_pair();
    let _client_loop = spawn_run(&client);
    let _server_loop = spawn_run(&server);

    client.update_local(|stream| stream.write(b"pwd\n")).await;
    assert_eq!(read_until(&server, 4, Duration::from_secs(5)).await, b"pwd\n");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let json = client.stats().await.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["role"], "client");
    assert_eq!(value["local_state_num"], 1);
    assert_eq!(value["known_receiver_state"], 1);
    assert_eq!(value["pending_states"], 0);
    assert!(value["datagrams_sent"].as_u64().unwrap() >= 1);
}

/// 実際の UDP ソケット（ループバック）でも同じように動く
#[tokio::test]
async fn test_udp_loopback_session() {
    let client_channel = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let server_channel = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let server_addr = server_channel.local_addr().unwrap();
    let client_addr = client_channel.local_addr().unwrap();

    let config = SessionConfig::from_json(r#"{ "receive_timeout_ms": 50 }"#).unwrap();
    let client = Arc::new(Session::client(
        client_channel,
        StreamState::new(),
        key(),
        server_addr,
        config.clone(),
    ));
    let server = Arc::new(Session::server(server_channel, StreamState::new(), key(), config));
    let client_loop = spawn_run(&client);
    let server_loop = spawn_run(&server);

    client.update_local(|stream| stream.write(b"ls\n")).await;
    assert_eq!(read_until(&server, 3, Duration::from_secs(5)).await, b"ls\n");
    assert_eq!(server.remote_addr().await, Some(client_addr));

    server.update_local(|stream| stream.write(b"README.md\n")).await;
    assert_eq!(read_until(&client, 10, Duration::from_secs(5)).await, b"README.md\n");

    client.start_shutdown().await;
    join(client_loop, Duration::from_secs(10)).await;
    join(server_loop, Duration::from_secs(10)).await;
    assert!(client.shutdown_acknowledged().await);
}
