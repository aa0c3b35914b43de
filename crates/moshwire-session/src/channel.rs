//! データグラムの送受信路
//!
//! セッションは `DatagramChannel` だけを通して外部と通信する。
//! 実運用では `UdpChannel`、テストでは `MemoryChannel` を使う。

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// 受信バッファの大きさ（UDP ペイロードの最大長）
pub const RECV_BUFFER_SIZE: usize = 65535;

/// データグラムの送受信路
///
/// 送信は UDP と同じくベストエフォート。届かなくてもエラーにしなくてよい。
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// `target` にデータグラムを 1 つ送る
    async fn send(&self, target: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    /// データグラムを 1 つ受け取る
    ///
    /// `timeout` 以内に届かなければ `Ok(None)`。
    async fn receive(&self, timeout: Duration) -> io::Result<Option<(SocketAddr, Vec<u8>)>>;

    /// チャンネルを閉じる（以降の送受信は失敗する）
    fn close(&self);

    fn is_open(&self) -> bool;
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel closed")
}

/// tokio の UDP ソケット
///
/// `close` でソケットを手放す。受信待ちの途中で閉じた場合は、その待ちが終わった時点で解放される。
pub struct UdpChannel {
    socket: StdMutex<Option<Arc<UdpSocket>>>,
}

impl UdpChannel {
    /// `addr` にバインドする
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket))
    }

    /// バインド済みのソケットから生成する
    pub fn from_socket(socket: UdpSocket) -> Self {
        UdpChannel {
            socket: StdMutex::new(Some(Arc::new(socket))),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket()?.local_addr()
    }

    /// ロックは await をまたがない。閉じていれば `NotConnected`
    fn socket(&self) -> io::Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_error)
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    async fn send(&self, target: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let socket = self.socket()?;
        socket.send_to(datagram, target).await.map(|_| ())
    }

    async fn receive(&self, timeout: Duration) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        let socket = self.socket()?;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                buf.truncate(len);
                Ok(Some((from, buf)))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(None),
        }
    }

    fn close(&self) {
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(socket);
    }

    fn is_open(&self) -> bool {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

type Envelope = (SocketAddr, Vec<u8>);
type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// メモリ上のデータグラム路（テスト用）
///
/// `pair` で作った 2 つのチャンネルは互いに送り合う。送信先アドレスは記録されるだけで、
/// データグラムは常にもう片方に届く。送信元アドレスは `set_local_addr` で変えられる
/// （ローミングの再現）。
pub struct MemoryChannel {
    local_addr: StdMutex<SocketAddr>,
    peer: mpsc::UnboundedSender<Envelope>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    open: AtomicBool,
    /// `true` を返したデータグラムは送信時に捨てる
    drop_filter: StdMutex<Option<DropFilter>>,
    last_send_target: StdMutex<Option<SocketAddr>>,
}

impl MemoryChannel {
    /// アドレス `a` と `b` を持つ、つながった 2 つのチャンネルを生成する
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (MemoryChannel, MemoryChannel) {
        let (to_a, a_inbox) = mpsc::unbounded_channel();
        let (to_b, b_inbox) = mpsc::unbounded_channel();
        (Self::new(a, to_b, a_inbox), Self::new(b, to_a, b_inbox))
    }

    fn new(
        local: SocketAddr,
        peer: mpsc::UnboundedSender<Envelope>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        MemoryChannel {
            local_addr: StdMutex::new(local),
            peer,
            inbox: Mutex::new(inbox),
            open: AtomicBool::new(true),
            drop_filter: StdMutex::new(None),
            last_send_target: StdMutex::new(None),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 以降の送信元アドレスを変える
    pub fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = addr;
    }

    /// 送信するデータグラムを捨てるかどうかの判定関数を設定する
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        *self.drop_filter.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// 最後に `send` に渡された送信先
    pub fn last_send_target(&self) -> Option<SocketAddr> {
        *self.last_send_target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DatagramChannel for MemoryChannel {
    async fn send(&self, target: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(closed_error());
        }
        *self.last_send_target.lock().unwrap_or_else(PoisonError::into_inner) = Some(target);

        let dropped = {
            let mut filter = self.drop_filter.lock().unwrap_or_else(PoisonError::into_inner);
            match filter.as_mut() {
                Some(filter) => filter(datagram),
                None => false,
            }
        };
        if dropped {
            return Ok(());
        }
        // 相手がいなくなっていても UDP と同じく黙って失う
        let _ = self.peer.send((self.local_addr(), datagram.to_vec()));
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        if !self.is_open() {
            return Err(closed_error());
        }
        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(envelope)) => Ok(Some(envelope)),
            Ok(None) => {
                // 相手側が破棄された。何も届かないのでタイムアウトまで待つ
                drop(inbox);
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
