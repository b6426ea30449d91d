//! The vault: custodian of a single storage directory.
//!
//! At most one primary X25519 identity, at most one recovery recipient, and a
//! flat set of items. The identity key and the metadata HMAC secret live in
//! enclaves for the lifetime of an unlock; plaintext values only ever exist in
//! locked buffers scoped to one operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use sentinel_common::{Error, Result};
use sentinel_crypto::{
    agefile, integrity, passphrase, seal,
    enclave::{Enclave, LockedBuffer},
};
use sentinel_storage::Backend;

use crate::item::Item;
use crate::upgrade;

const IDENTITY_FILE: &str = ".identity";
const RECOVERY_FILE: &str = ".recovery";
const RECOVERY_SUM_FILE: &str = ".recovery.sum";

/// Construction options for a [`Vault`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VaultOptions {
    /// Secure (production) mode; adds the domain suffix to key derivation.
    pub secure: bool,
    /// Operator confirmation for legitimizing a pre-0.2.0 recovery
    /// recipient on upgrade. Without it such an unlock fails closed.
    pub confirm_recovery_upgrade: bool,
}

/// Unlocked-state secrets and the item map; absent while locked.
struct OpenState {
    identity_key: Enclave,
    metadata_secret: Enclave,
    primary_recipient: age::x25519::Recipient,
    items: HashMap<Uuid, Item>,
}

/// Single-process custodian of a vault directory.
///
/// One reader/writer lock protects the enclaves, the recovery state and the
/// item map; it is held across the filesystem side effects of every mutation
/// so external readers never observe a torn metadata file.
pub struct Vault {
    backend: Arc<dyn Backend>,
    options: VaultOptions,
    state: RwLock<Option<OpenState>>,
}

impl Vault {
    /// Create a vault over `backend`, initializing the backend.
    pub async fn new(backend: Arc<dyn Backend>, options: VaultOptions) -> Result<Self> {
        backend
            .init()
            .await
            .map_err(|e| Error::Config(format!("failed to initialize backend: {e}")))?;

        Ok(Self {
            backend,
            options,
            state: RwLock::new(None),
        })
    }

    /// Whether the vault is currently locked.
    pub async fn is_locked(&self) -> bool {
        self.state.read().await.is_none()
    }

    /// Unlock the vault and load all item metadata.
    ///
    /// A fresh directory gains a new identity sealed under the derived key.
    /// Every failure mode is reported as the same opaque [`Error::Auth`]
    /// (upgrade refusals excepted) and leaves the vault locked.
    pub async fn unlock(&self, passphrase: SecretString) -> Result<()> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Ok(());
        }

        let identity_key = passphrase::derive_identity_key(passphrase, self.options.secure);

        let opened_key = identity_key.open();
        let identity = match self.backend.read_file(IDENTITY_FILE).await {
            Err(e) => {
                error!(error = %e, "failed to read identity file");
                return Err(Error::Auth);
            }
            Ok(Some(_)) => match read_identity(self.backend.as_ref(), opened_key).await {
                Ok(identity) => identity,
                Err(e) => {
                    error!(error = %e, "failed to read identity file");
                    return Err(Error::Auth);
                }
            },
            Ok(None) => {
                let identity = age::x25519::Identity::generate();
                if let Err(e) =
                    write_identity(self.backend.as_ref(), opened_key, &identity).await
                {
                    error!(error = %e, "failed to write identity");
                    return Err(Error::Auth);
                }

                identity
            }
        };

        let metadata_secret = derive_metadata_secret(&identity);
        let primary_recipient = identity.to_public();
        drop(identity);

        let opened_secret = metadata_secret.open();
        upgrade::upgrade(
            self.backend.as_ref(),
            &opened_secret,
            self.options.confirm_recovery_upgrade,
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "vault upgrade failed");
            e
        })?;

        let items = match read_all_metadata(self.backend.as_ref(), &opened_secret).await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "failed to read all item metadata");
                return Err(Error::Auth);
            }
        };
        drop(opened_secret);

        info!(items = items.len(), "vault unlocked");

        *state = Some(OpenState {
            identity_key,
            metadata_secret,
            primary_recipient,
            items,
        });

        Ok(())
    }

    /// Compare a candidate passphrase against the in-memory derived key.
    ///
    /// Constant-time; does not touch the filesystem.
    pub async fn verify_passphrase(&self, candidate: SecretString) -> Result<()> {
        let state = self.state.read().await;
        let open = state.as_ref().ok_or(Error::Locked)?;

        let key = open.identity_key.open();
        if passphrase::verify_identity_key(candidate, self.options.secure, &key) {
            Ok(())
        } else {
            info!("incorrect passphrase specified");
            Err(Error::Auth)
        }
    }

    /// Lock the vault, wiping all enclaves and the item map.
    pub async fn lock(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.take().is_none() {
            return Err(Error::Locked);
        }

        info!("vault locked");
        Ok(())
    }

    /// Snapshot of the current item metadata.
    pub async fn items(&self) -> Result<Vec<Item>> {
        let state = self.state.read().await;
        let open = state.as_ref().ok_or(Error::Locked)?;

        Ok(open.items.values().cloned().collect())
    }

    /// Create a new item with no value.
    pub async fn create_item(&self, description: String) -> Result<Item> {
        let mut state = self.state.write().await;
        let open = state.as_mut().ok_or(Error::Locked)?;

        let item = Item::new(description);

        let secret = open.metadata_secret.open();
        if let Err(e) =
            write_item_metadata(self.backend.as_ref(), &item, &secret).await
        {
            error!(item = %item.id, error = %e, "failed to write item metadata");
            return Err(Error::Internal("failed to create item".to_string()));
        }

        open.items.insert(item.id, item.clone());

        Ok(item)
    }

    /// Delete an item's metadata and value files. Idempotent.
    pub async fn delete_item(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let open = state.as_mut().ok_or(Error::Locked)?;

        let Some(item) = open.items.remove(&id) else {
            warn!(item = %id, "no such item");
            return Ok(());
        };

        let mut removed = false;
        for name in [item.metadata_name(), item.value_name()] {
            match self.backend.delete_file(&name).await {
                Ok(deleted) => removed |= deleted,
                Err(e) => debug!(item = %id, file = %name, error = %e, "failed to delete item file"),
            }
        }

        if removed {
            info!(item = %id, "removed files for item");
        }

        Ok(())
    }

    /// Read an item's decrypted value; `None` if no value has been set.
    pub async fn get_item(&self, id: Uuid) -> Result<Option<LockedBuffer>> {
        let state = self.state.read().await;
        let open = state.as_ref().ok_or(Error::Locked)?;

        let item = open
            .items
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("item {id}")))?;

        if !item.has_value() {
            return Ok(None);
        }

        self.read_item_value(open, item).await.map(Some)
    }

    /// Read an item's value on behalf of a peer, pinning the peer on first
    /// access.
    ///
    /// Takes the exclusive lock because a first read persists the pin.
    pub async fn get_item_for_peer(&self, id: Uuid, peer: &str) -> Result<Option<LockedBuffer>> {
        let mut state = self.state.write().await;
        let open = state.as_mut().ok_or(Error::Locked)?;

        let item = open
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("item {id}")))?;

        match &item.peer {
            None => {
                let mut pinned = item.clone();
                pinned.peer = Some(peer.to_string());

                let secret = open.metadata_secret.open();
                if let Err(e) =
                    write_item_metadata(self.backend.as_ref(), &pinned, &secret).await
                {
                    error!(item = %id, error = %e, "failed to write item metadata");
                    return Err(Error::Internal(format!("failed to verify peer for {id}")));
                }

                info!(item = %id, peer, "pinned item to peer");
                open.items.insert(id, pinned);
            }
            Some(existing) if existing != peer => {
                warn!(item = %id, peer, "invalid peer for item");
                return Err(Error::PeerMismatch);
            }
            Some(_) => {}
        }

        let item = &open.items[&id];
        if !item.has_value() {
            return Ok(None);
        }

        let value = self.read_item_value(open, item).await?;
        Ok(Some(value))
    }

    /// Set an item's value, snapshotting any previous value under `.bak/`.
    pub async fn set_item_value(&self, id: Uuid, value: LockedBuffer) -> Result<()> {
        if value.is_empty() {
            return Err(Error::InvalidInput("value is empty".to_string()));
        }

        let mut state = self.state.write().await;
        let open = state.as_mut().ok_or(Error::Locked)?;

        let item = open
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("item {id}")))?;

        let updated = self.write_item_value(open, item, &value).await?;
        open.items.insert(id, updated);

        Ok(())
    }

    /// Replace the recovery recipient and re-encrypt every stored value to
    /// the new recipient set.
    ///
    /// The rotation is committed before the re-encryption loop; each per-item
    /// re-encryption is best-effort (failures log and continue).
    pub async fn set_recovery_recipient(&self, recipient: age::x25519::Recipient) -> Result<()> {
        let mut state = self.state.write().await;
        let open = state.as_mut().ok_or(Error::Locked)?;

        let secret = open.metadata_secret.open();

        let previous = load_recovery_recipient(self.backend.as_ref(), &secret)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to load recovery recipient");
                Error::Internal("failed to set recovery recipient".to_string())
            })?;

        if let Err(e) =
            write_recovery_recipient(self.backend.as_ref(), &recipient, &secret).await
        {
            error!(error = %e, "failed to write recovery recipient");

            if let Some(previous) = previous {
                let mut restored = false;
                for _ in 0..3 {
                    tokio::time::sleep(Duration::from_secs(1)).await;

                    if write_recovery_recipient(self.backend.as_ref(), &previous, &secret)
                        .await
                        .is_ok()
                    {
                        restored = true;
                        break;
                    }
                }

                if !restored {
                    error!("failed to restore previous recovery recipient");
                }
            }

            return Err(Error::Internal(
                "failed to set recovery recipient".to_string(),
            ));
        }

        let items = match read_all_metadata(self.backend.as_ref(), &secret).await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "failed to read all item metadata");
                return Err(Error::Internal(
                    "failed to set recovery recipient".to_string(),
                ));
            }
        };
        drop(secret);

        for item in items.into_values() {
            if !item.has_value() {
                continue;
            }

            let value = match self.read_item_value(open, &item).await {
                Ok(value) => value,
                Err(e) => {
                    error!(item = %item.id, error = %e, "failed to read item value");
                    continue;
                }
            };

            match self.write_item_value(open, item.clone(), &value).await {
                Ok(updated) => {
                    open.items.insert(updated.id, updated);
                }
                Err(e) => {
                    error!(item = %item.id, error = %e, "failed to write item value");
                }
            }
        }

        Ok(())
    }

    async fn read_item_value(&self, open: &OpenState, item: &Item) -> Result<LockedBuffer> {
        let corrupt = || Error::CorruptValue(item.id.to_string());

        let age_bytes = match self.backend.read_file(&item.value_name()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                error!(item = %item.id, "item value file not found");
                return Err(corrupt());
            }
            Err(e) => {
                error!(item = %item.id, error = %e, "failed to read item value");
                return Err(corrupt());
            }
        };

        let key = open.identity_key.open();
        let identity = read_identity(self.backend.as_ref(), key)
            .await
            .map_err(|e| {
                error!(item = %item.id, error = %e, "error reading identity");
                corrupt()
            })?;

        let value = agefile::decrypt_with_identity(&age_bytes, &identity).map_err(|e| {
            error!(item = %item.id, error = %e, "error decrypting item value");
            corrupt()
        })?;

        if integrity::hex_checksum(value.bytes()) != item.checksum {
            error!(item = %item.id, "checksum mismatch");
            return Err(corrupt());
        }

        Ok(value)
    }

    async fn write_item_value(
        &self,
        open: &OpenState,
        mut item: Item,
        value: &LockedBuffer,
    ) -> Result<Item> {
        let fail = |step: &str, e: &Error, id: Uuid| {
            error!(item = %id, error = %e, "{step}");
            Error::Internal(format!("failed to write item value ({id})"))
        };

        let secret = open.metadata_secret.open();

        let mut recipients = vec![open.primary_recipient.clone()];
        if let Some(recovery) = load_recovery_recipient(self.backend.as_ref(), &secret)
            .await
            .map_err(|e| fail("error loading recovery recipient", &e, item.id))?
        {
            recipients.push(recovery);
        }

        let age_bytes = agefile::encrypt_to_recipients(value.bytes(), &recipients)
            .map_err(|e| fail("failed to encrypt item value", &e, item.id))?;

        if item.has_value() {
            copy_file(
                self.backend.as_ref(),
                &item.value_name(),
                &item.backup_name(Utc::now()),
            )
            .await
            .map_err(|e| fail("failed to create backup of previous value", &e, item.id))?;
        }

        item.checksum = integrity::hex_checksum(value.bytes());
        item.modified_at = Utc::now();

        self.backend
            .write_file(&item.value_name(), &age_bytes)
            .await
            .map_err(|e| fail("failed to write item value", &e, item.id))?;

        write_item_metadata(self.backend.as_ref(), &item, &secret)
            .await
            .map_err(|e| fail("failed to write item metadata", &e, item.id))?;

        Ok(item)
    }
}

/// Read and unseal the primary identity.
///
/// Consumes the opened key buffer; the plaintext identity text is wiped
/// before returning.
async fn read_identity(
    backend: &dyn Backend,
    key: LockedBuffer,
) -> Result<age::x25519::Identity> {
    let sealed = backend
        .read_file(IDENTITY_FILE)
        .await?
        .ok_or_else(|| Error::Crypto("identity file not found".to_string()))?;

    let raw = Zeroizing::new(seal::unseal(key.bytes(), &sealed)?);
    drop(key);

    let text = std::str::from_utf8(&raw)
        .map_err(|_| Error::Crypto("identity is not valid UTF-8".to_string()))?;

    text.trim()
        .parse::<age::x25519::Identity>()
        .map_err(|e| Error::Crypto(format!("invalid identity: {e}")))
}

/// Seal and persist the primary identity.
async fn write_identity(
    backend: &dyn Backend,
    key: LockedBuffer,
    identity: &age::x25519::Identity,
) -> Result<()> {
    let text = identity.to_string();
    let sealed = seal::seal(key.bytes(), text.expose_secret().as_bytes())?;
    drop(key);

    backend.write_file(IDENTITY_FILE, &sealed).await
}

/// Derive the metadata HMAC secret from the identity's textual form.
fn derive_metadata_secret(identity: &age::x25519::Identity) -> Enclave {
    let text = identity.to_string();
    let digest = integrity::digest(text.expose_secret().as_bytes());
    Enclave::new(digest.to_vec())
}

pub(crate) fn recovery_hash(recipient: &age::x25519::Recipient, secret: &LockedBuffer) -> String {
    let mut bytes = Zeroizing::new(recipient.to_string().into_bytes());
    bytes.extend_from_slice(secret.bytes());
    integrity::hex_checksum(&bytes)
}

/// Load the recovery recipient, verifying its HMAC binding.
async fn load_recovery_recipient(
    backend: &dyn Backend,
    secret: &LockedBuffer,
) -> Result<Option<age::x25519::Recipient>> {
    let Some(rec_bytes) = backend.read_file(RECOVERY_FILE).await? else {
        return Ok(None);
    };

    let sum_bytes = backend
        .read_file(RECOVERY_SUM_FILE)
        .await?
        .ok_or_else(|| Error::Crypto(format!("{RECOVERY_SUM_FILE} is missing")))?;

    let text = std::str::from_utf8(&rec_bytes)
        .map_err(|_| Error::Crypto("recovery recipient is not valid UTF-8".to_string()))?;
    let recipient = text
        .trim()
        .parse::<age::x25519::Recipient>()
        .map_err(|e| Error::Crypto(format!("invalid recovery recipient: {e}")))?;

    if sum_bytes != recovery_hash(&recipient, secret).as_bytes() {
        return Err(Error::Crypto(format!("{RECOVERY_SUM_FILE} does not match")));
    }

    Ok(Some(recipient))
}

/// Persist a recovery recipient together with its HMAC binding.
async fn write_recovery_recipient(
    backend: &dyn Backend,
    recipient: &age::x25519::Recipient,
    secret: &LockedBuffer,
) -> Result<()> {
    backend
        .write_file(RECOVERY_FILE, recipient.to_string().as_bytes())
        .await?;

    let hash = recovery_hash(recipient, secret);
    if let Err(e) = backend.write_file(RECOVERY_SUM_FILE, hash.as_bytes()).await {
        let _ = backend.delete_file(RECOVERY_FILE).await;
        return Err(e);
    }

    Ok(())
}

/// Load every metadata file, skipping (and logging) corrupt entries.
async fn read_all_metadata(
    backend: &dyn Backend,
    secret: &LockedBuffer,
) -> Result<HashMap<Uuid, Item>> {
    let listing = backend.list_files("").await?;

    let mut items = HashMap::new();
    for entry in listing {
        if !entry.ends_with(".json") {
            continue;
        }

        match read_item_metadata(backend, &entry, secret).await {
            Ok(item) => {
                items.insert(item.id, item);
            }
            Err(e) => {
                warn!(source = %entry, error = %e, "error reading item metadata");
            }
        }
    }

    Ok(items)
}

/// Read one metadata file, verifying its tag and self-naming invariant.
async fn read_item_metadata(
    backend: &dyn Backend,
    name: &str,
    secret: &LockedBuffer,
) -> Result<Item> {
    let data = backend
        .read_file(name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("metadata file {name}")))?;

    let payload = integrity::split_verified(secret.bytes(), &data)
        .map_err(|_| Error::CorruptMetadata(format!("{name}: checksum mismatch")))?;

    let item: Item = serde_json::from_slice(payload)
        .map_err(|e| Error::CorruptMetadata(format!("{name}: {e}")))?;

    if name != item.metadata_name() {
        return Err(Error::CorruptMetadata(format!(
            "metadata path doesn't match item id: {}",
            item.id
        )));
    }

    Ok(item)
}

/// Serialize and persist one metadata file with its trailing tag.
async fn write_item_metadata(
    backend: &dyn Backend,
    item: &Item,
    secret: &LockedBuffer,
) -> Result<()> {
    let payload = serde_json::to_vec(item)?;
    let tagged = integrity::append_tag(secret.bytes(), &payload);

    backend.write_file(&item.metadata_name(), &tagged).await
}

async fn copy_file(backend: &dyn Backend, src: &str, dest: &str) -> Result<()> {
    let data = backend
        .read_file(src)
        .await?
        .ok_or_else(|| Error::NotFound(format!("file does not exist: {src}")))?;

    backend.write_file(dest, &data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_storage::MemoryBackend;

    async fn unlocked_vault() -> (Arc<MemoryBackend>, Vault) {
        let backend = Arc::new(MemoryBackend::new());
        let vault = Vault::new(backend.clone(), VaultOptions::default())
            .await
            .unwrap();
        vault
            .unlock(SecretString::from("correct horse"))
            .await
            .unwrap();
        (backend, vault)
    }

    #[tokio::test]
    async fn test_operations_require_unlock() {
        let backend = Arc::new(MemoryBackend::new());
        let vault = Vault::new(backend, VaultOptions::default()).await.unwrap();

        assert!(matches!(vault.items().await, Err(Error::Locked)));
        assert!(matches!(
            vault.create_item("x".to_string()).await,
            Err(Error::Locked)
        ));
        assert!(matches!(
            vault.get_item(Uuid::new_v4()).await,
            Err(Error::Locked)
        ));
    }

    #[tokio::test]
    async fn test_value_roundtrip_and_checksum() {
        // Scenario: fresh vault, "db" item, value "hi".
        let (_backend, vault) = unlocked_vault().await;

        let item = vault.create_item("db".to_string()).await.unwrap();
        vault
            .set_item_value(item.id, LockedBuffer::new(vec![0x68, 0x69]))
            .await
            .unwrap();

        let value = vault.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(value.bytes(), &[0x68, 0x69]);

        let listed = vault.items().await.unwrap();
        assert_eq!(
            listed[0].checksum,
            "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"
        );
    }

    #[tokio::test]
    async fn test_relock_cycle_with_wrong_passphrase() {
        let (backend, vault) = unlocked_vault().await;

        let item = vault.create_item("db".to_string()).await.unwrap();
        vault
            .set_item_value(item.id, LockedBuffer::new(b"hi".to_vec()))
            .await
            .unwrap();
        vault.lock().await.unwrap();

        assert!(matches!(
            vault.unlock(SecretString::from("wrong")).await,
            Err(Error::Auth)
        ));
        assert!(vault.is_locked().await);

        let vault = Vault::new(backend, VaultOptions::default()).await.unwrap();
        vault
            .unlock(SecretString::from("correct horse"))
            .await
            .unwrap();

        let value = vault.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(value.bytes(), b"hi");
    }

    #[tokio::test]
    async fn test_item_without_value_reads_none() {
        let (_backend, vault) = unlocked_vault().await;
        let item = vault.create_item("empty".to_string()).await.unwrap();

        assert!(vault.get_item(item.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_item_not_found() {
        let (_backend, vault) = unlocked_vault().await;
        assert!(matches!(
            vault.get_item(Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_value_rejected() {
        let (_backend, vault) = unlocked_vault().await;
        let item = vault.create_item("db".to_string()).await.unwrap();

        assert!(matches!(
            vault.set_item_value(item.id, LockedBuffer::new(Vec::new())).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_pinning() {
        let (_backend, vault) = unlocked_vault().await;
        let item = vault.create_item("db".to_string()).await.unwrap();
        vault
            .set_item_value(item.id, LockedBuffer::new(b"pw".to_vec()))
            .await
            .unwrap();

        // First peer pins the item.
        let value = vault
            .get_item_for_peer(item.id, "10.0.0.7:3131")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value.bytes(), b"pw");

        // A different peer is rejected and the pin stays intact.
        assert!(matches!(
            vault.get_item_for_peer(item.id, "10.0.0.9:3131").await,
            Err(Error::PeerMismatch)
        ));

        let listed = vault.items().await.unwrap();
        assert_eq!(listed[0].peer.as_deref(), Some("10.0.0.7:3131"));

        // The original peer still reads fine.
        assert!(vault
            .get_item_for_peer(item.id, "10.0.0.7:3131")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_peer_pin_survives_relock() {
        let (backend, vault) = unlocked_vault().await;
        let item = vault.create_item("db".to_string()).await.unwrap();
        vault.get_item_for_peer(item.id, "client-a").await.unwrap();
        vault.lock().await.unwrap();

        let vault = Vault::new(backend, VaultOptions::default()).await.unwrap();
        vault
            .unlock(SecretString::from("correct horse"))
            .await
            .unwrap();

        assert!(matches!(
            vault.get_item_for_peer(item.id, "client-b").await,
            Err(Error::PeerMismatch)
        ));
    }

    #[tokio::test]
    async fn test_corrupt_metadata_drops_only_that_item() {
        let (backend, vault) = unlocked_vault().await;

        let healthy = vault.create_item("healthy".to_string()).await.unwrap();
        let doomed = vault.create_item("doomed".to_string()).await.unwrap();
        vault.lock().await.unwrap();

        backend
            .corrupt(&doomed.metadata_name(), |data| data[3] ^= 0xFF)
            .await;

        let vault = Vault::new(backend, VaultOptions::default()).await.unwrap();
        vault
            .unlock(SecretString::from("correct horse"))
            .await
            .unwrap();

        let items = vault.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, healthy.id);
    }

    #[tokio::test]
    async fn test_corrupt_value_fails_and_keeps_metadata() {
        let (backend, vault) = unlocked_vault().await;

        let item = vault.create_item("db".to_string()).await.unwrap();
        vault
            .set_item_value(item.id, LockedBuffer::new(b"secret".to_vec()))
            .await
            .unwrap();

        backend.corrupt(&item.value_name(), |data| {
            let last = data.len() - 1;
            data[last] ^= 0xFF;
        })
        .await;

        assert!(matches!(
            vault.get_item(item.id).await,
            Err(Error::CorruptValue(_))
        ));

        // Metadata is untouched.
        let listed = vault.items().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].has_value());
    }

    #[tokio::test]
    async fn test_renamed_metadata_file_is_rejected() {
        let (backend, vault) = unlocked_vault().await;
        let item = vault.create_item("db".to_string()).await.unwrap();
        vault.lock().await.unwrap();

        // Copy the valid metadata under a different uuid name.
        let data = backend.read_file(&item.metadata_name()).await.unwrap().unwrap();
        let other = format!("{}.json", Uuid::new_v4());
        backend.write_file(&other, &data).await.unwrap();

        let vault = Vault::new(backend, VaultOptions::default()).await.unwrap();
        vault
            .unlock(SecretString::from("correct horse"))
            .await
            .unwrap();

        // The forged copy is dropped, the original survives.
        assert_eq!(vault.items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (backend, vault) = unlocked_vault().await;
        let item = vault.create_item("db".to_string()).await.unwrap();
        vault
            .set_item_value(item.id, LockedBuffer::new(b"v".to_vec()))
            .await
            .unwrap();

        vault.delete_item(item.id).await.unwrap();
        vault.delete_item(item.id).await.unwrap();

        assert!(vault.items().await.unwrap().is_empty());
        assert_eq!(backend.read_file(&item.value_name()).await.unwrap(), None);
        assert_eq!(
            backend.read_file(&item.metadata_name()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_overwrite_snapshots_previous_value() {
        let (backend, vault) = unlocked_vault().await;
        let item = vault.create_item("db".to_string()).await.unwrap();

        vault
            .set_item_value(item.id, LockedBuffer::new(b"one".to_vec()))
            .await
            .unwrap();
        let first = backend.read_file(&item.value_name()).await.unwrap().unwrap();

        vault
            .set_item_value(item.id, LockedBuffer::new(b"two".to_vec()))
            .await
            .unwrap();

        let value = vault.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(value.bytes(), b"two");

        // The first ciphertext was snapshotted under .bak/ before overwrite.
        let snapshot_prefix = format!(".bak/{}.", item.id);
        let snapshots: Vec<String> = backend
            .names()
            .await
            .into_iter()
            .filter(|name| name.starts_with(&snapshot_prefix))
            .collect();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            backend.read_file(&snapshots[0]).await.unwrap().unwrap(),
            first
        );
    }

    #[tokio::test]
    async fn test_verify_passphrase_leaves_vault_usable() {
        let (_backend, vault) = unlocked_vault().await;

        assert!(matches!(
            vault.verify_passphrase(SecretString::from("wrong")).await,
            Err(Error::Auth)
        ));
        assert!(!vault.is_locked().await);

        vault
            .verify_passphrase(SecretString::from("correct horse"))
            .await
            .unwrap();
        vault.create_item("still works".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_rotation_keeps_values_readable() {
        let (backend, vault) = unlocked_vault().await;

        let a = vault.create_item("a".to_string()).await.unwrap();
        let b = vault.create_item("b".to_string()).await.unwrap();
        vault
            .set_item_value(a.id, LockedBuffer::new(b"alpha".to_vec()))
            .await
            .unwrap();
        vault
            .set_item_value(b.id, LockedBuffer::new(b"beta".to_vec()))
            .await
            .unwrap();

        let recovery = age::x25519::Identity::generate();
        vault
            .set_recovery_recipient(recovery.to_public())
            .await
            .unwrap();

        // Both sidecar files exist.
        assert!(backend.read_file(RECOVERY_FILE).await.unwrap().is_some());
        assert!(backend
            .read_file(RECOVERY_SUM_FILE)
            .await
            .unwrap()
            .is_some());

        // Values still read back through the vault.
        assert_eq!(
            vault.get_item(a.id).await.unwrap().unwrap().bytes(),
            b"alpha"
        );
        assert_eq!(
            vault.get_item(b.id).await.unwrap().unwrap().bytes(),
            b"beta"
        );

        // And every on-disk value now decrypts under the recovery identity.
        for item in [&a, &b] {
            let age_bytes = backend
                .read_file(&item.value_name())
                .await
                .unwrap()
                .unwrap();
            assert!(agefile::decrypt_with_identity(&age_bytes, &recovery).is_ok());
        }
    }

    #[tokio::test]
    async fn test_new_values_include_recovery_recipient() {
        let (backend, vault) = unlocked_vault().await;

        let recovery = age::x25519::Identity::generate();
        vault
            .set_recovery_recipient(recovery.to_public())
            .await
            .unwrap();

        let item = vault.create_item("db".to_string()).await.unwrap();
        vault
            .set_item_value(item.id, LockedBuffer::new(b"late".to_vec()))
            .await
            .unwrap();

        let age_bytes = backend
            .read_file(&item.value_name())
            .await
            .unwrap()
            .unwrap();
        let plain = agefile::decrypt_with_identity(&age_bytes, &recovery).unwrap();
        assert_eq!(plain.bytes(), b"late");
    }

    #[tokio::test]
    async fn test_tampered_recovery_recipient_is_rejected() {
        let (backend, vault) = unlocked_vault().await;

        let recovery = age::x25519::Identity::generate();
        vault
            .set_recovery_recipient(recovery.to_public())
            .await
            .unwrap();

        // Swap in an attacker-controlled recipient without updating the sum.
        let attacker = age::x25519::Identity::generate();
        backend
            .write_file(RECOVERY_FILE, attacker.to_public().to_string().as_bytes())
            .await
            .unwrap();

        let item = vault.create_item("db".to_string()).await.unwrap();
        let result = vault
            .set_item_value(item.id, LockedBuffer::new(b"v".to_vec()))
            .await;

        assert!(result.is_err());
    }
}
