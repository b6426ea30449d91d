//! RPC-facing service contracts.
//!
//! The transport (framing, TLS, listeners) lives outside this crate; these
//! are the unary handler contracts it calls into. Every credential-bearing
//! request is zeroed synchronously when its handler returns, and responses
//! carrying secret bytes implement [`Zero`] so the transport can wipe them
//! after the send completes.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use secrecy::SecretString;
use uuid::Uuid;
use zeroize::Zeroize;

use sentinel_common::{Error, Result};
use sentinel_crypto::{enclave::LockedBuffer, integrity};

use crate::item::Item;
use crate::vault::Vault;

/// Wipe hook for request and response messages.
pub trait Zero {
    /// Overwrite all secret-bearing fields.
    fn zero(&mut self);
}

/// Administrator credentials: the master passphrase.
#[derive(Clone)]
pub struct AdminCredentials {
    pub passphrase: String,
}

impl Zero for AdminCredentials {
    fn zero(&mut self) {
        self.passphrase.zeroize();
    }
}

/// Client credentials scoped to a single item.
#[derive(Clone)]
pub struct ClientCredentials {
    pub id: String,
    pub secret: String,
}

impl ClientCredentials {
    /// Deterministic peer identity for pinning.
    ///
    /// The transport's remote address is not part of the service contract,
    /// so the pinned peer is derived from the credential pair itself: the
    /// first authenticated read pins it, any different pair afterwards is a
    /// peer mismatch.
    fn peer_identity(&self) -> String {
        format!(
            "{}:{}",
            self.id,
            integrity::hex_checksum(self.secret.as_bytes())
        )
    }
}

impl Zero for ClientCredentials {
    fn zero(&mut self) {
        self.id.zeroize();
        self.secret.zeroize();
    }
}

/// Either side of the credential split.
#[derive(Clone)]
pub enum Credentials {
    Admin(AdminCredentials),
    Client(ClientCredentials),
}

impl Zero for Credentials {
    fn zero(&mut self) {
        match self {
            Credentials::Admin(creds) => creds.zero(),
            Credentials::Client(creds) => creds.zero(),
        }
    }
}

/// Chunked input for `set_item_value`.
pub type ValueStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Response carrying an item's decrypted value.
///
/// `value` is `None` for items that exist but have no value yet. The
/// transport must call [`Zero::zero`] after the response has been sent.
pub struct GetItemResponse {
    pub value: Option<Vec<u8>>,
}

impl Zero for GetItemResponse {
    fn zero(&mut self) {
        if let Some(value) = &mut self.value {
            value.zeroize();
        }
    }
}

/// Service facade over a shared vault.
pub struct VaultService {
    vault: Arc<Vault>,
}

impl VaultService {
    /// Wrap a vault for service use.
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    /// Access the underlying vault.
    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    async fn ensure_admin(&self, credentials: &AdminCredentials) -> Result<()> {
        self.vault
            .verify_passphrase(SecretString::from(credentials.passphrase.clone()))
            .await
    }

    /// Unlock the vault.
    pub async fn unlock(&self, mut credentials: AdminCredentials) -> Result<()> {
        let passphrase = SecretString::from(std::mem::take(&mut credentials.passphrase));
        let result = self.vault.unlock(passphrase).await;
        credentials.zero();
        result
    }

    /// Lock the vault.
    pub async fn lock(&self, mut credentials: AdminCredentials) -> Result<()> {
        let result = async {
            self.ensure_admin(&credentials).await?;
            self.vault.lock().await
        }
        .await;

        credentials.zero();
        result
    }

    /// Verify the passphrase without touching storage.
    pub async fn verify(&self, mut credentials: AdminCredentials) -> Result<()> {
        let passphrase = SecretString::from(std::mem::take(&mut credentials.passphrase));
        let result = self.vault.verify_passphrase(passphrase).await;
        credentials.zero();
        result
    }

    /// List item metadata.
    pub async fn list(&self, mut credentials: AdminCredentials) -> Result<Vec<Item>> {
        let result = async {
            self.ensure_admin(&credentials).await?;
            self.vault.items().await
        }
        .await;

        credentials.zero();
        result
    }

    /// Create a metadata-only item.
    pub async fn create_item(
        &self,
        mut credentials: AdminCredentials,
        description: String,
    ) -> Result<Item> {
        let result = async {
            self.ensure_admin(&credentials).await?;
            self.vault.create_item(description).await
        }
        .await;

        credentials.zero();
        result
    }

    /// Delete an item.
    pub async fn delete_item(
        &self,
        mut credentials: AdminCredentials,
        id: Uuid,
    ) -> Result<()> {
        let result = async {
            self.ensure_admin(&credentials).await?;
            self.vault.delete_item(id).await
        }
        .await;

        credentials.zero();
        result
    }

    /// Replace the recovery recipient.
    pub async fn set_recovery_recipient(
        &self,
        mut credentials: AdminCredentials,
        recipient: String,
    ) -> Result<()> {
        let result = async {
            self.ensure_admin(&credentials).await?;

            let recipient = recipient
                .trim()
                .parse::<age::x25519::Recipient>()
                .map_err(|e| Error::InvalidInput(format!("invalid recipient: {e}")))?;

            self.vault.set_recovery_recipient(recipient).await
        }
        .await;

        credentials.zero();
        result
    }

    /// Set an item's value from a chunk stream.
    ///
    /// The chunks are assembled in a locked buffer before they reach the
    /// vault; each chunk is wiped as soon as it has been appended.
    pub async fn set_item_value(
        &self,
        mut credentials: AdminCredentials,
        id: Uuid,
        mut chunks: ValueStream,
    ) -> Result<()> {
        let result = async {
            self.ensure_admin(&credentials).await?;

            let mut assembled = Vec::new();
            while let Some(chunk) = chunks.next().await {
                let mut chunk = chunk?;
                assembled.extend_from_slice(&chunk);
                chunk.zeroize();
            }

            self.vault
                .set_item_value(id, LockedBuffer::new(assembled))
                .await
        }
        .await;

        credentials.zero();
        result
    }

    /// Read an item's value with either credential kind.
    ///
    /// Client credentials pin the item to the derived peer identity on
    /// first read. The returned response must be zeroed by the transport
    /// after the send.
    pub async fn get_item(
        &self,
        mut credentials: Credentials,
        id: Uuid,
    ) -> Result<GetItemResponse> {
        let result = async {
            let value = match &credentials {
                Credentials::Admin(admin) => {
                    self.ensure_admin(admin).await?;
                    self.vault.get_item(id).await?
                }
                Credentials::Client(client) => {
                    self.vault
                        .get_item_for_peer(id, &client.peer_identity())
                        .await?
                }
            };

            Ok(GetItemResponse {
                value: value.map(|buffer| buffer.bytes().to_vec()),
            })
        }
        .await;

        credentials.zero();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use sentinel_storage::MemoryBackend;

    use crate::vault::VaultOptions;

    const PASS: &str = "correct horse";

    async fn service() -> VaultService {
        let backend = Arc::new(MemoryBackend::new());
        let vault = Vault::new(backend, VaultOptions::default()).await.unwrap();
        vault.unlock(SecretString::from(PASS)).await.unwrap();
        VaultService::new(Arc::new(vault))
    }

    fn admin() -> AdminCredentials {
        AdminCredentials {
            passphrase: PASS.to_string(),
        }
    }

    fn chunks(parts: &[&[u8]]) -> ValueStream {
        let owned: Vec<Result<Vec<u8>>> =
            parts.iter().map(|part| Ok(part.to_vec())).collect();
        Box::pin(stream::iter(owned))
    }

    #[tokio::test]
    async fn test_admin_flow_roundtrip() {
        let service = service().await;

        let item = service
            .create_item(admin(), "db".to_string())
            .await
            .unwrap();
        service
            .set_item_value(admin(), item.id, chunks(&[&b"hun"[..], &b"ter2"[..]]))
            .await
            .unwrap();

        let response = service
            .get_item(Credentials::Admin(admin()), item.id)
            .await
            .unwrap();
        assert_eq!(response.value.as_deref(), Some(b"hunter2".as_slice()));
    }

    #[tokio::test]
    async fn test_wrong_admin_passphrase_rejected() {
        let service = service().await;

        let creds = AdminCredentials {
            passphrase: "wrong".to_string(),
        };
        assert!(matches!(
            service.list(creds).await,
            Err(Error::Auth)
        ));
    }

    #[tokio::test]
    async fn test_client_credentials_pin_item() {
        let service = service().await;

        let item = service
            .create_item(admin(), "db".to_string())
            .await
            .unwrap();
        service
            .set_item_value(admin(), item.id, chunks(&[&b"pw"[..]]))
            .await
            .unwrap();

        let first = Credentials::Client(ClientCredentials {
            id: "backup-host".to_string(),
            secret: "s3cret".to_string(),
        });
        let response = service.get_item(first.clone(), item.id).await.unwrap();
        assert_eq!(response.value.as_deref(), Some(b"pw".as_slice()));

        // Same pair reads again; a different secret does not.
        assert!(service.get_item(first, item.id).await.is_ok());

        let other = Credentials::Client(ClientCredentials {
            id: "backup-host".to_string(),
            secret: "different".to_string(),
        });
        assert!(matches!(
            service.get_item(other, item.id).await,
            Err(Error::PeerMismatch)
        ));
    }

    #[tokio::test]
    async fn test_zero_wipes_messages() {
        let mut creds = Credentials::Client(ClientCredentials {
            id: "client".to_string(),
            secret: "topsecret".to_string(),
        });
        creds.zero();
        if let Credentials::Client(client) = &creds {
            assert!(client.id.is_empty());
            assert!(client.secret.is_empty());
        }

        let mut response = GetItemResponse {
            value: Some(b"secret".to_vec()),
        };
        response.zero();
        assert!(response.value.as_ref().unwrap().is_empty());
    }
}
