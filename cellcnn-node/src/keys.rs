//! Collective key setup.
//!
//! Every party draws an additive share of the secret key from its own
//! stream; the shared secret is their sum, and one public key plus the
//! evaluation keys are derived from it for the whole federation.

use cellcnn::rng::party_rng;
use cellcnn::{CnnConfig, CryptoContext, Result};
use cellcnn_ckks::{CkksScheme, Complex64};
use log::info;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};

/// Stream of a party generator reserved for its key share.
const KEY_SHARE_STREAM: u64 = 1;
/// Stream of the root generator used for public and evaluation keys.
const KEY_GEN_STREAM: u64 = 2;

/// Shared context for `parties` participants, and the aggregate secret the
/// collective refresh decrypts with.
pub fn collective_setup<S: CkksScheme>(
    scheme: S,
    config: &CnnConfig,
    parties: usize,
) -> Result<(CryptoContext<S>, S::SecretKey)> {
    let shares: Vec<S::SecretKey> = (0..parties)
        .map(|p| {
            let mut rng = party_rng(config, p);
            rng.set_stream(KEY_SHARE_STREAM);
            scheme.gen_secret_key(&mut rng)
        })
        .collect();
    let sk = scheme.aggregate_secret_keys(&shares)?;

    let mut rng = party_rng(config, 0);
    rng.set_stream(KEY_GEN_STREAM);
    let ctx = CryptoContext::from_secret(scheme, &sk, &config.layout(), &mut rng)?;
    info!("collective key from {} shares, fingerprint {}", parties, key_fingerprint(&ctx)?);
    Ok((ctx, sk))
}

/// First 8 bytes of SHA-256 over a fixed encryption of zero, hex-encoded.
/// Parties holding the same public key print the same fingerprint.
pub fn key_fingerprint<S: CkksScheme>(ctx: &CryptoContext<S>) -> Result<String> {
    let mut rng = ChaCha20Rng::seed_from_u64(0);
    let ct = ctx.encrypt(&[Complex64::new(0.0, 0.0)], ctx.max_level(), &mut rng)?;
    let digest = Sha256::digest(ctx.ciphertext_to_bytes(&ct)?);
    Ok(hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellcnn_ckks::SimulatedCkks;

    fn config(seed: u64) -> CnnConfig {
        CnnConfig {
            cells: 2,
            features: 4,
            filters: 2,
            classes: 2,
            batch_size: 2,
            samples: 1,
            log_n: 8,
            log_slots: 7,
            levels: 11,
            deterministic: true,
            seed,
            ..CnnConfig::default()
        }
    }

    fn setup(seed: u64, parties: usize) -> (CryptoContext<SimulatedCkks>, cellcnn_ckks::simulated::SimSecretKey) {
        let config = config(seed);
        let scheme = SimulatedCkks::new(config.ckks_parameters().unwrap());
        collective_setup(scheme, &config, parties).unwrap()
    }

    #[test]
    fn fingerprints_follow_the_shares() {
        let (a, _) = setup(1, 3);
        let (b, _) = setup(1, 3);
        let (c, _) = setup(2, 3);
        let (d, _) = setup(1, 2);
        let fa = key_fingerprint(&a).unwrap();
        assert_eq!(fa.len(), 16);
        assert_eq!(fa, key_fingerprint(&b).unwrap());
        assert_ne!(fa, key_fingerprint(&c).unwrap());
        assert_ne!(fa, key_fingerprint(&d).unwrap());
    }

    #[test]
    fn aggregate_key_decrypts() {
        let (ctx, sk) = setup(4, 3);
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let ct = ctx.encrypt(&[Complex64::new(0.75, 0.0)], ctx.max_level(), &mut rng).unwrap();
        let out = ctx.decrypt_real(&ct, &sk).unwrap();
        assert!((out[0] - 0.75).abs() < 1e-6);
    }
}
