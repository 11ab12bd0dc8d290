use aether_common::{GatewayError, GatewayResult};

/// Credential-encryption seam. The actual primitive lives outside the
/// gateway; attempts decrypt through this trait per candidate and never cache
/// the plaintext.
pub trait SecretCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> GatewayResult<String>;
}

/// Pass-through cipher for deployments that store keys in a pre-decrypted
/// secret mount (and for tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCipher;

impl SecretCipher for PassthroughCipher {
    fn decrypt(&self, ciphertext: &str) -> GatewayResult<String> {
        if ciphertext.is_empty() {
            return Err(GatewayError::DecryptionError);
        }
        Ok(ciphertext.to_string())
    }
}
