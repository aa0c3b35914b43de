//! AES-128-OCB3 の薄いラッパー
//!
//! mosh の暗号化は「鍵 + 12バイト nonce + 平文 → 暗号文 + 16バイトタグ」のみ。
//! 関連データ (AD) は使用しない。

use alloc::vec::Vec;

use aead::{Aead, KeyInit};
use aes::Aes128;
use ocb3::Ocb3;

use crate::error::CryptoError;
use crate::nonce::MoshNonce;

/// AES-128-OCB3 (12バイト nonce, 16バイト tag) の型エイリアス
type Aes128Ocb3 = Ocb3<Aes128>;

/// 認証タグ長
pub const TAG_LEN: usize = 16;

/// 鍵長（AES-128）
pub const KEY_LEN: usize = 16;

/// AES-128-OCB3 による暗号化/復号
///
/// nonce の一意性はこの型では保証しない（`CryptoSession` が担当する）。
pub struct SspCipher {
    cipher: Aes128Ocb3,
}

impl SspCipher {
    /// 16 バイトの raw 鍵から初期化する
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        SspCipher {
            cipher: Aes128Ocb3::new(key.into()),
        }
    }

    /// 平文を暗号化し、暗号文 + 認証タグを返す
    pub fn encrypt(&self, nonce: &MoshNonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(nonce.as_bytes().into(), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// 暗号文 + 認証タグを復号する
    ///
    /// # エラー
    /// - `CryptoError::DecryptionFailed`: タグ検証失敗（改ざん・鍵違い・nonce 違い）
    pub fn decrypt(&self, nonce: &MoshNonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(nonce.as_bytes().into(), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
