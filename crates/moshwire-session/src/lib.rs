//! # moshwire-session
//!
//! 暗号化・Fragment・SSP 送受信を 1 つのセッションにまとめる。
//!
//! ## 使用方法
//!
//! ```no_run
//! use moshwire_crypto::MoshKey;
//! use moshwire_session::{Session, SessionConfig, UdpChannel};
//! use moshwire_stream::StreamState;
//!
//! # async fn example() -> Result<(), moshwire_session::SessionError> {
//! let key = MoshKey::from_base64("4NeCCgvZFe2RnPgrcU1PQw")?;
//! let channel = UdpChannel::bind("0.0.0.0:0".parse().unwrap()).await?;
//! let server = "192.0.2.1:60001".parse().unwrap();
//!
//! let session = Session::client(channel, StreamState::new(), key, server, SessionConfig::default());
//!
//! // キー入力を送る
//! session.update_local(|stream| stream.write(b"ls\n")).await;
//!
//! // 送受信ループ（シャットダウン完了かクローズで戻る）
//! session.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## 送信経路
//!
//! ```text
//! StateSync::diff_since → Instruction → protobuf → zlib + Fragment 分割
//!   → AES-128-OCB3（nonce = 方向 + シーケンス番号）→ DatagramChannel::send
//! ```
//!
//! 受信経路はその逆順。途中で失敗したデータグラムはすべて黙って破棄する。

pub mod channel;
pub mod config;
pub mod error;
pub mod session;
pub mod stats;

pub use channel::{DatagramChannel, MemoryChannel, UdpChannel};
pub use config::SessionConfig;
pub use error::SessionError;
pub use session::{Received, Session};
pub use stats::SessionStats;

use moshwire_crypto::Direction;
use moshwire_stream::StreamState;
use serde::{Deserialize, Serialize};

/// バイトストリームを同期するセッション
pub type StreamSession<C> = Session<C, StreamState>;

/// セッションの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// mosh-client 側（サーバーのアドレスを知っている）
    Client,
    /// mosh-server 側（最新のパケットの送信元にローミングする）
    Server,
}

impl Role {
    /// 送信するパケットの方向
    pub fn send_direction(self) -> Direction {
        match self {
            Role::Client => Direction::ToServer,
            Role::Server => Direction::ToClient,
        }
    }

    /// 受け入れるパケットの方向
    pub fn receive_direction(self) -> Direction {
        self.send_direction().reverse()
    }
}
