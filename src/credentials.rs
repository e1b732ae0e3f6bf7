//! Encryption of delegated GitHub credentials at rest.
//!
//! Tokens are sealed with AES-256-GCM under a fresh random nonce. The stored
//! form is `enc:v1:` followed by base64 of `nonce || ciphertext`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::store::{Store, StoreError};
use crate::types::Project;

const PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("stored credential has no enc:v1 prefix")]
    UnknownFormat,

    #[error("stored credential is not valid base64: {0}")]
    Encoding(String),

    #[error("stored credential is truncated")]
    Truncated,

    /// Wrong key, or the ciphertext was tampered with.
    #[error("credential could not be decrypted")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("decrypted credential is not UTF-8")]
    NotUtf8,
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// A decrypted access token. Only ever held in memory.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        AccessToken(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Seals and opens access tokens with one process-wide key.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        TokenCipher {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    pub fn encrypt(&self, token: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(format!("{PREFIX}{}", STANDARD.encode(out)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let encoded = stored
            .strip_prefix(PREFIX)
            .ok_or(CredentialError::UnknownFormat)?;
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| CredentialError::Encoding(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(CredentialError::Truncated);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CredentialError::NotUtf8)
    }

    /// Decrypts a stored credential into an [`AccessToken`].
    pub fn open(&self, stored: &str) -> Result<AccessToken> {
        self.decrypt(stored).map(AccessToken)
    }
}

/// Why a project's delegated credential is unavailable.
#[derive(Debug, Error)]
pub enum TokenLookupError {
    /// The project owner never linked a GitHub account.
    #[error("github_not_linked")]
    NotLinked,

    #[error("github_credential_unreadable: {0}")]
    Unreadable(#[from] CredentialError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Decrypts the linked GitHub token of `project`'s owner.
pub fn owner_token(
    store: &Store,
    cipher: &TokenCipher,
    project: &Project,
) -> std::result::Result<AccessToken, TokenLookupError> {
    let account = store
        .linked_account(project.owner_user_id)?
        .ok_or(TokenLookupError::NotLinked)?;
    Ok(cipher.open(&account.access_token_enc)?)
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_token_opens_with_same_key() {
        let cipher = TokenCipher::new(&[9u8; 32]);
        let sealed = cipher.encrypt("gho_secret").unwrap();
        assert!(sealed.starts_with("enc:v1:"));
        assert!(!sealed.contains("gho_secret"));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "gho_secret");
    }

    #[test]
    fn opened_token_is_redacted_in_debug() {
        let cipher = TokenCipher::new(&[9u8; 32]);
        let token = cipher.open(&cipher.encrypt("gho_secret").unwrap()).unwrap();
        assert_eq!(token.expose(), "gho_secret");
        assert_eq!(format!("{token:?}"), "AccessToken(***)");
    }

    #[test]
    fn owner_token_requires_linked_account() {
        use crate::store::LinkedAccount;
        use crate::types::UserId;

        let store = Store::in_memory().unwrap();
        let cipher = TokenCipher::new(&[3u8; 32]);
        let project = store.create_project(UserId(1), "acme/widgets").unwrap();

        assert!(matches!(
            owner_token(&store, &cipher, &project),
            Err(TokenLookupError::NotLinked)
        ));

        store
            .link_account(&LinkedAccount {
                user_id: UserId(1),
                github_login: "owner".to_string(),
                access_token_enc: cipher.encrypt("gho_owner").unwrap(),
                scopes: "repo".to_string(),
                linked_at: chrono::Utc::now(),
            })
            .unwrap();
        let token = owner_token(&store, &cipher, &project).unwrap();
        assert_eq!(token.expose(), "gho_owner");

        let other = TokenCipher::new(&[4u8; 32]);
        assert!(matches!(
            owner_token(&store, &other, &project),
            Err(TokenLookupError::Unreadable(CredentialError::Decrypt))
        ));
    }

    #[test]
    fn nonces_are_fresh() {
        let cipher = TokenCipher::new(&[9u8; 32]);
        assert_ne!(cipher.encrypt("t").unwrap(), cipher.encrypt("t").unwrap());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = TokenCipher::new(&[1u8; 32]).encrypt("t").unwrap();
        assert_eq!(
            TokenCipher::new(&[2u8; 32]).decrypt(&sealed),
            Err(CredentialError::Decrypt)
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        let cipher = TokenCipher::new(&[1u8; 32]);
        assert_eq!(cipher.decrypt("plain"), Err(CredentialError::UnknownFormat));
        assert_eq!(
            cipher.decrypt("enc:v1:AAAA"),
            Err(CredentialError::Truncated)
        );
        assert!(matches!(
            cipher.decrypt("enc:v1:!!!"),
            Err(CredentialError::Encoding(_))
        ));
    }
}
