//! On-disk format migration performed during unlock.

use semver::Version;
use tracing::info;

use sentinel_common::{Error, Result};
use sentinel_crypto::enclave::LockedBuffer;
use sentinel_storage::Backend;

const VERSION_FILE: &str = ".version";
const RECOVERY_FILE: &str = ".recovery";
const RECOVERY_SUM_FILE: &str = ".recovery.sum";

/// Current on-disk format version, written at the end of every unlock.
pub fn format_version() -> Version {
    Version::new(0, 3, 0)
}

/// Last format version whose recovery recipient carried no HMAC binding.
fn version_before_recovery_verified() -> Version {
    Version::new(0, 2, 0)
}

/// Bring the vault directory up to the current format version.
///
/// A pre-0.2.0 vault with an existing `.recovery` gains its `.recovery.sum`
/// here. Because that legitimizes whatever recipient is on disk using the
/// in-memory identity, the write is gated behind explicit operator
/// confirmation and otherwise fails closed.
pub(crate) async fn upgrade(
    backend: &dyn Backend,
    metadata_secret: &LockedBuffer,
    confirm_recovery_upgrade: bool,
) -> Result<()> {
    let current = match backend.read_file(VERSION_FILE).await? {
        Some(bytes) => {
            let text = String::from_utf8(bytes)
                .map_err(|_| Error::Config("invalid version file".to_string()))?;
            Some(
                Version::parse(text.trim())
                    .map_err(|e| Error::Config(format!("invalid version file: {e}")))?,
            )
        }
        None => None,
    };

    let needs_recovery_sum = match &current {
        Some(version) => *version <= version_before_recovery_verified(),
        None => true,
    };

    if needs_recovery_sum {
        if backend.read_file(RECOVERY_SUM_FILE).await?.is_some() {
            return Err(Error::Config(format!(
                "{RECOVERY_SUM_FILE} exists for a pre-{} vault",
                version_before_recovery_verified()
            )));
        }

        if let Some(rec_bytes) = backend.read_file(RECOVERY_FILE).await? {
            if !confirm_recovery_upgrade {
                return Err(Error::Config(format!(
                    "vault carries an unverified recovery recipient from an \
                     earlier version; re-run with --confirm-recovery-upgrade \
                     to accept it or remove {RECOVERY_FILE}"
                )));
            }

            let text = String::from_utf8(rec_bytes)
                .map_err(|_| Error::Config("invalid recovery recipient".to_string()))?;
            let recipient = text
                .trim()
                .parse::<age::x25519::Recipient>()
                .map_err(|e| Error::Config(format!("invalid recovery recipient: {e}")))?;

            let hash = crate::vault::recovery_hash(&recipient, metadata_secret);
            backend
                .write_file(RECOVERY_SUM_FILE, hash.as_bytes())
                .await?;

            info!("verified pre-existing recovery recipient during upgrade");
        }
    }

    backend
        .write_file(VERSION_FILE, format_version().to_string().as_bytes())
        .await
}
