//! SSP セッション
//!
//! 暗号セッション・Fragment・SSP 送受信・同期対象の状態を 1 つにまとめ、
//! `DatagramChannel` の上で動かす。
//!
//! ```text
//! Session
//!   ├── DatagramChannel  - UDP / メモリ上のデータグラム路
//!   └── Mutex<Core>
//!         ├── CryptoSession     (moshwire-crypto)    - AES-128-OCB3 とシーケンス番号
//!         ├── Fragmenter        (moshwire-transport) - Instruction を Fragment に分割
//!         ├── FragmentAssembly  (moshwire-transport) - Fragment を再組み立て
//!         ├── TimestampEcho     (moshwire-transport) - RTT 計測用のエコー
//!         ├── Sender / Receiver (moshwire-ssp)       - SSP 状態機械
//!         └── S: StateSync                           - 同期対象の状態
//! ```
//!
//! 送信と受信はどちらも Core のロックを取って状態を更新する。
//! チャンネルの送受信はロックの外で行う。

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use moshwire_crypto::{CryptoSession, MoshKey};
use moshwire_proto::{make_chaff, Instruction};
use moshwire_ssp::{Receiver, Sender, StateSync};
use moshwire_transport::{rtt_sample, FragmentAssembly, Fragmenter, Timestamp16, TimestampEcho};

use crate::channel::DatagramChannel;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::stats::{Counters, SessionStats};
use crate::Role;

/// 受信したデータグラム 1 つの処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// タイムアウトまで何も届かなかった
    Timeout,
    /// 復号・展開・デコードのいずれかに失敗して捨てた
    Discarded,
    /// Fragment を受け取ったが、Instruction はまだ揃っていない
    Fragment,
    /// Instruction を処理した（`remote_state` は受け取った最大の状態番号）
    Instruction { remote_state: u64 },
}

/// ロックで保護されるセッションの内部状態
struct Core<S> {
    crypto: CryptoSession,
    fragmenter: Fragmenter,
    assembly: FragmentAssembly,
    sender: Sender,
    receiver: Receiver,
    echo: TimestampEcho,
    state: S,
    /// 送信先（サーバーは最初のパケットを受け取るまで分からない）
    remote: Option<SocketAddr>,
    counters: Counters,
    timeout_reported: bool,
}

impl<S: StateSync> Core<S> {
    /// 受信したデータグラムを処理する
    fn handle_datagram(
        &mut self,
        role: Role,
        config: &SessionConfig,
        from: SocketAddr,
        packet: &[u8],
        now_ms: u64,
    ) -> Received {
        self.counters.datagrams_received += 1;

        let opened = match self.crypto.decrypt_packet(packet) {
            Ok(opened) => opened,
            Err(err) => {
                tracing::trace!(%from, error = %err, "discarding undecryptable datagram");
                return self.discard();
            }
        };
        let datagram = opened.datagram;

        if opened.is_newest {
            if role == Role::Server && self.remote != Some(from) {
                tracing::debug!(%from, previous = ?self.remote, "remote address changed");
                self.remote = Some(from);
            }
            self.echo.on_remote_timestamp(Timestamp16(datagram.timestamp), now_ms);
            if let Some(sample) =
                rtt_sample(Timestamp16(datagram.timestamp_reply), now_ms, config.max_rtt_sample_ms)
            {
                self.sender.observe_rtt(sample);
            }
        }

        let instruction_bytes = match self.assembly.decode(&datagram.payload) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Received::Fragment,
            Err(err) => {
                tracing::trace!(seq = datagram.seq, error = %err, "discarding bad fragment");
                return self.discard();
            }
        };
        let instr = match Instruction::decode_from_bytes(&instruction_bytes) {
            Ok(instr) => instr,
            Err(err) => {
                tracing::trace!(seq = datagram.seq, error = %err, "discarding bad instruction");
                return self.discard();
            }
        };
        self.counters.instructions_received += 1;

        if self.sender.record_peer_ack(instr.ack_num_or_zero(), now_ms) {
            let (_, acked) = self.sender.known_state();
            self.state.on_acked(acked);
        }

        let before = self.receiver.latest_num();
        let latest = self.receiver.receive(&instr, &mut self.state);
        self.sender.set_ack_num(latest);

        if latest != before {
            tracing::debug!(old_num = before, new_num = latest, "new remote state");
        }
        // 差分のない Instruction（ハートビート）には ACK を急がない
        if latest != before || instr.has_diff() {
            self.sender.remote_heard(now_ms);
        }

        Received::Instruction { remote_state: latest }
    }

    fn discard(&mut self) -> Received {
        self.counters.datagrams_discarded += 1;
        Received::Discarded
    }

    /// 次の Instruction を組み立て、暗号化済みのデータグラム列にする
    fn build_datagrams(
        &mut self,
        config: &SessionConfig,
        now_ms: u64,
    ) -> Result<Vec<Vec<u8>>, SessionError> {
        let instr = if self.sender.shutdown_in_progress() {
            self.sender.next_instruction(now_ms, None, |_| Vec::new())
        } else {
            let current = self.state.current_state();
            match current.as_deref() {
                Some(current) if self.sender.needs_data(current) => {
                    let state = &self.state;
                    self.sender
                        .next_instruction(now_ms, Some(current), |base| state.diff_since(base))
                }
                _ => None,
            }
        };
        let instr = instr
            .unwrap_or_else(|| self.sender.heartbeat_instruction(now_ms))
            .with_chaff(make_chaff());

        let fragments = self
            .fragmenter
            .make_fragments(&instr.encode_to_bytes(), config.max_fragment_len())?;
        tracing::trace!(
            old_num = instr.old_num_or_zero(),
            new_num = instr.new_num_or_zero(),
            ack_num = instr.ack_num_or_zero(),
            fragments = fragments.len(),
            "sending instruction"
        );

        let timestamp = Timestamp16::now_from_ms(now_ms).raw();
        let mut datagrams = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            let reply = self.echo.reply(now_ms).raw();
            datagrams.push(self.crypto.encrypt_packet(timestamp, reply, &fragment.to_bytes())?);
        }
        Ok(datagrams)
    }

    /// 送受信ループを抜けてよいか
    fn finished(&self) -> bool {
        let sender = &self.sender;
        let shutdown_over = sender.shutdown_acknowledged() || sender.shutdown_timed_out();
        if sender.shutdown_in_progress() && shutdown_over {
            return true;
        }
        self.receiver.peer_shutdown() && sender.counterparty_shutdown_ack_sent()
    }
}

/// SSP セッション
///
/// ## スレッド安全性
///
/// すべてのメソッドは `&self` で呼べる。`Arc<Session>` を共有して、
/// `run()` を動かしながら別のタスクから `update_local` で状態を書き換えられる。
pub struct Session<C, S> {
    role: Role,
    channel: C,
    config: SessionConfig,
    /// セッション内の時刻（ミリ秒）の起点
    started: Instant,
    core: Mutex<Core<S>>,
}

impl<C, S> Session<C, S>
where
    C: DatagramChannel,
    S: StateSync + Send,
{
    /// セッションを生成する
    ///
    /// # 引数
    /// - `role`: 送信方向とローミングの扱いを決める
    /// - `channel`: データグラムの送受信路
    /// - `state`: 同期対象の状態
    /// - `key`: mosh-server が出力したセッション鍵
    /// - `remote`: 送信先。サーバーは `None` で始め、最初のパケットの送信元を使う
    pub fn new(
        role: Role,
        channel: C,
        state: S,
        key: MoshKey,
        remote: Option<SocketAddr>,
        config: SessionConfig,
    ) -> Self {
        let started = Instant::now();
        let core = Core {
            crypto: CryptoSession::from_key(*key.as_bytes(), role.send_direction()),
            fragmenter: Fragmenter::new(),
            assembly: FragmentAssembly::new(),
            sender: Sender::new(0),
            receiver: Receiver::new(),
            echo: TimestampEcho::new(),
            state,
            remote,
            counters: Counters::default(),
            timeout_reported: false,
        };
        Session {
            role,
            channel,
            config,
            started,
            core: Mutex::new(core),
        }
    }

    /// クライアントのセッション（送信先は `server`）
    pub fn client(
        channel: C,
        state: S,
        key: MoshKey,
        server: SocketAddr,
        config: SessionConfig,
    ) -> Self {
        Self::new(Role::Client, channel, state, key, Some(server), config)
    }

    /// サーバーのセッション（送信先は最初に届いたパケットの送信元）
    pub fn server(channel: C, state: S, key: MoshKey, config: SessionConfig) -> Self {
        Self::new(Role::Server, channel, state, key, None, config)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 設定の受信タイムアウトでデータグラムを 1 つ受け取って処理する
    pub async fn receive_once(&self) -> Result<Received, SessionError> {
        self.receive_with_timeout(self.config.receive_timeout()).await
    }

    /// データグラムを 1 つ受け取って処理する
    ///
    /// 復号できない・壊れているデータグラムはエラーではなく `Received::Discarded`。
    ///
    /// # エラー
    /// - `SessionError::Closed`: チャンネルが閉じている
    /// - `SessionError::Io`: チャンネルの受信エラー
    pub async fn receive_with_timeout(&self, timeout: Duration) -> Result<Received, SessionError> {
        if !self.channel.is_open() {
            return Err(SessionError::Closed);
        }
        let Some((from, packet)) = self.channel.receive(timeout).await? else {
            return Ok(Received::Timeout);
        };
        let now_ms = self.now_ms();
        let mut core = self.core.lock().await;
        Ok(core.handle_datagram(self.role, &self.config, from, &packet, now_ms))
    }

    /// 送信すべき時刻なら Instruction を 1 つ送り、次の送信までの待ち時間を返す
    ///
    /// 送信先がまだ分からない（サーバーで何も受け取っていない）間は何も送らない。
    /// 個々のデータグラムの送信失敗はログに残して数えるだけ。
    ///
    /// # エラー
    /// - `SessionError::Closed`: チャンネルが閉じている
    /// - `SessionError::Transport`: Instruction が Fragment の上限を超えた
    /// - `SessionError::Crypto`: 送信シーケンス番号を使い切った
    pub async fn tick(&self) -> Result<Duration, SessionError> {
        if !self.channel.is_open() {
            return Err(SessionError::Closed);
        }
        let now_ms = self.now_ms();

        let (target, datagrams) = {
            let mut core = self.core.lock().await;
            let wait = core.sender.wait_time(now_ms);
            if wait > 0 {
                return Ok(Duration::from_millis(wait));
            }
            let Some(target) = core.remote else {
                return Ok(self.config.receive_timeout());
            };
            (target, core.build_datagrams(&self.config, now_ms)?)
        };

        let mut sent = 0;
        let mut failed = 0;
        for datagram in &datagrams {
            match self.channel.send(target, datagram).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    tracing::warn!(%target, error = %err, "failed to send datagram");
                    failed += 1;
                }
            }
        }

        let mut core = self.core.lock().await;
        core.counters.datagrams_sent += sent;
        core.counters.send_failures += failed;
        Ok(Duration::from_millis(core.sender.wait_time(self.now_ms())))
    }

    /// ローカルの状態を更新する
    ///
    /// 状態が変わったら次の送信間隔で相手に送られる。
    pub async fn update_local<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut S) -> R,
    {
        let mut core = self.core.lock().await;
        let before = core.state.current_state();
        let result = f(&mut core.state);
        if core.state.current_state() != before {
            core.sender.mark_dirty();
        }
        result
    }

    /// 状態にアクセスする（受信データの読み出しなど）
    ///
    /// 送信すべき変更をした場合は `update_local` を使うこと。
    pub async fn with_state<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut S) -> R,
    {
        let mut core = self.core.lock().await;
        f(&mut core.state)
    }

    /// シャットダウンを開始する
    pub async fn start_shutdown(&self) {
        self.core.lock().await.sender.start_shutdown();
    }

    /// 相手がシャットダウンを ACK した
    pub async fn shutdown_acknowledged(&self) -> bool {
        self.core.lock().await.sender.shutdown_acknowledged()
    }

    /// シャットダウンの再送回数が上限に達した
    pub async fn shutdown_timed_out(&self) -> bool {
        self.core.lock().await.sender.shutdown_timed_out()
    }

    /// 相手から長い間 ACK が届いていない
    pub async fn connection_timed_out(&self) -> bool {
        let now_ms = self.now_ms();
        self.core.lock().await.sender.connection_timed_out(now_ms)
    }

    /// 相手がシャットダウンを開始した
    pub async fn peer_shutdown(&self) -> bool {
        self.core.lock().await.receiver.peer_shutdown()
    }

    /// 現在の送信先
    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        self.core.lock().await.remote
    }

    /// チャンネルを閉じる（`run()` は受信タイムアウト以内に戻る）
    pub fn close(&self) {
        self.channel.close();
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn stats(&self) -> SessionStats {
        let core = self.core.lock().await;
        let sender = core.sender.stats();
        SessionStats {
            role: self.role,
            srtt_ms: sender.srtt_ms,
            rttvar_ms: sender.rttvar_ms,
            rto_ms: sender.rto_ms,
            local_state_num: sender.next_state_num.saturating_sub(1),
            known_receiver_state: sender.known_receiver_state,
            remote_state_num: core.receiver.latest_num(),
            pending_states: sender.pending_states,
            datagrams_sent: core.counters.datagrams_sent,
            datagrams_received: core.counters.datagrams_received,
            datagrams_discarded: core.counters.datagrams_discarded,
            send_failures: core.counters.send_failures,
            instructions_received: core.counters.instructions_received,
        }
    }

    /// 送受信ループ
    ///
    /// 次のいずれかで `Ok(())` を返す:
    /// - チャンネルが閉じられた
    /// - 自分のシャットダウンが ACK された、または再送回数が上限に達した
    /// - 相手のシャットダウンに ACK を返した
    ///
    /// 接続タイムアウトでは終了せず、警告を出して送受信を続ける。
    pub async fn run(&self) -> Result<(), SessionError> {
        let receive_timeout = self.config.receive_timeout();
        loop {
            if !self.channel.is_open() {
                tracing::debug!("channel closed, leaving session loop");
                return Ok(());
            }
            if self.check_finished().await {
                return Ok(());
            }

            let wait = match self.tick().await {
                Ok(wait) => wait,
                Err(SessionError::Closed) => return Ok(()),
                Err(err) => return Err(err),
            };
            if self.check_finished().await {
                return Ok(());
            }

            let timeout = wait.min(receive_timeout).max(Duration::from_millis(1));
            match self.receive_with_timeout(timeout).await {
                Ok(_) => {}
                Err(SessionError::Closed) => return Ok(()),
                Err(err) => tracing::warn!(error = %err, "receive failed"),
            }
        }
    }

    /// ループの終了条件を確認し、接続タイムアウトを一度だけ警告する
    async fn check_finished(&self) -> bool {
        let now_ms = self.now_ms();
        let mut core = self.core.lock().await;
        if core.finished() {
            tracing::debug!(role = ?self.role, "session finished");
            return true;
        }
        let timed_out = core.sender.connection_timed_out(now_ms);
        if timed_out && !core.timeout_reported {
            tracing::warn!(role = ?self.role, "no acknowledgement from peer, connection timed out");
        }
        core.timeout_reported = timed_out;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use moshwire_stream::StreamState;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn key() -> MoshKey {
        MoshKey::from([7u8; 16])
    }

    fn pair() -> (Session<MemoryChannel, StreamState>, Session<MemoryChannel, StreamState>) {
        let (c, s) = MemoryChannel::pair(addr(1), addr(2));
        let config = SessionConfig::default();
        let client = Session::client(c, StreamState::new(), key(), addr(2), config);
        let server = Session::server(s, StreamState::new(), key(), SessionConfig::default());
        (client, server)
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_waits_for_first_packet() {
        let (client, server) = pair();
        assert_eq!(server.remote_addr().await, None);
        assert_eq!(server.tick().await.unwrap(), server.config().receive_timeout());
        assert_eq!(server.stats().await.datagrams_sent, 0);

        // クライアントの最初の送信は即座に行われる（ハートビート）
        client.tick().await.unwrap();
        assert_eq!(client.stats().await.datagrams_sent, 1);

        let received = server.receive_once().await.unwrap();
        assert_eq!(received, Received::Instruction { remote_state: 0 });
        assert_eq!(server.remote_addr().await, Some(addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_local_marks_dirty_only_on_change() {
        let (client, server) = pair();
        client.tick().await.unwrap();
        server.receive_once().await.unwrap();

        // 変更なし: 次の送信はキープアライブまで待つ
        client.update_local(|_| ()).await;
        let wait = client.tick().await.unwrap();
        assert!(wait > Duration::from_millis(250));

        client.update_local(|stream| stream.write(b"abc")).await;
        tokio::time::advance(Duration::from_millis(300)).await;
        client.tick().await.unwrap();
        assert_eq!(client.stats().await.local_state_num, 1);

        assert_eq!(server.receive_once().await.unwrap(), Received::Instruction { remote_state: 1 });
        let data = server.with_state(|stream| stream.read_available()).await;
        assert_eq!(data, b"abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_is_discarded_and_counted() {
        let (c, s) = MemoryChannel::pair(addr(1), addr(2));
        let server = Session::server(s, StreamState::new(), key(), SessionConfig::default());

        c.send(addr(2), &[0u8; 40]).await.unwrap();
        c.send(addr(2), &[1, 2, 3]).await.unwrap();
        assert_eq!(server.receive_once().await.unwrap(), Received::Discarded);
        assert_eq!(server.receive_once().await.unwrap(), Received::Discarded);

        let stats = server.stats().await;
        assert_eq!(stats.datagrams_received, 2);
        assert_eq!(stats.datagrams_discarded, 2);
        // 破棄したパケットの送信元にはローミングしない
        assert_eq!(server.remote_addr().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_reports_closed() {
        let (client, _server) = pair();
        client.close();
        assert!(!client.is_open());
        assert!(matches!(client.tick().await, Err(SessionError::Closed)));
        assert!(matches!(client.receive_once().await, Err(SessionError::Closed)));
        client.run().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_instruction_is_an_error() {
        let (c, _s) = MemoryChannel::pair(addr(1), addr(2));
        // ヘッダーしか入らない MTU では 1 バイトも運べない
        let config = SessionConfig {
            mtu: moshwire_crypto::DATAGRAM_OVERHEAD + 10,
            ..SessionConfig::default()
        };
        let client = Session::client(c, StreamState::new(), key(), addr(2), config);
        assert!(matches!(client.tick().await, Err(SessionError::Transport(_))));
    }
}
