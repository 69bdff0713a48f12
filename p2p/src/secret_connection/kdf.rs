//! Key derivation for the secret connection.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

/// "Key Derivation Function" for the secret connection's symmetric keys and
/// the (pre-transcript) challenge.
pub struct Kdf {
    /// Receiver's secret
    pub recv_secret: [u8; 32],

    /// Sender's secret
    pub send_secret: [u8; 32],

    /// Challenge to be signed by peer
    pub challenge: [u8; 32],
}

impl Kdf {
    /// Expand 96 bytes from the Diffie-Hellman secret and split them into
    /// the two directional keys plus the challenge. The lexically lesser
    /// side of the connection reads with the first half and writes with the
    /// second; the greater side swaps them.
    pub fn derive_secrets_and_challenge(shared_secret: &[u8], loc_is_least: bool) -> Self {
        let mut key_material = [0u8; 96];

        Hkdf::<Sha256>::new(None, shared_secret)
            .expand(
                b"TENDERMINT_SECRET_CONNECTION_KEY_AND_CHALLENGE_GEN",
                &mut key_material,
            )
            .expect("96 bytes is a valid length for HKDF-SHA256 output");

        let mut recv_secret = [0u8; 32];
        let mut send_secret = [0u8; 32];
        let mut challenge = [0u8; 32];

        if loc_is_least {
            recv_secret.copy_from_slice(&key_material[0..32]);
            send_secret.copy_from_slice(&key_material[32..64]);
        } else {
            send_secret.copy_from_slice(&key_material[0..32]);
            recv_secret.copy_from_slice(&key_material[32..64]);
        }

        challenge.copy_from_slice(&key_material[64..96]);
        key_material.zeroize();

        Self {
            recv_secret,
            send_secret,
            challenge,
        }
    }
}

impl Drop for Kdf {
    fn drop(&mut self) {
        self.recv_secret.zeroize();
        self.send_secret.zeroize();
        self.challenge.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subtle_encoding::hex;

    fn unhex32(s: &str) -> [u8; 32] {
        let bytes = hex::decode(s).unwrap();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        out
    }

    #[test]
    fn derives_key_and_challenge_vectors() {
        // (dh_secret, key1, key2, challenge)
        let vectors = [
            (
                "9fe4a5a73df12dbd8659b1d9280873fe993caefec6b0ebc2686dd65027148e03",
                "80a83ad6afcb6f8175192e41973aed31dd75e3c106f813d986d9567a4865eb2f",
                "96362a04f628a0666d9866147326898bb0847b8db8680263ad19e6336d4eed9e",
                "2632c3fd20f456c5383ed16aa1d56dc7875a2b0fc0d5ff053c3ada8934098c69",
            ),
            (
                "0716764b370d543fee692af03832c16410f0a56e4ddb79604ea093b10bb6f654",
                "cba357ae33d7234520d5742102a2a6cdb39b7db59c14a58fa8aadd310127630f",
                "84f2b1e8658456529a2c324f46c3406c3c6fecd5fbbf9169f60bed8956a8b03d",
                "576643a8fcc1a4cf866db900f4a150dbe35d44a1b3ff36e4911565c3fa22fc32",
            ),
            (
                "6104474c791cda24d952b356fb41a5d273c0ce6cc87d270b1701d0523cd5aa13",
                "1cb4397b9e478430321af4647da2ccbef62ff8888542d31cca3f626766c8080f",
                "673b23318826bd31ad1a4995c6e5095c4b092f5598aa0a96381a3e977bc0eaf9",
                "4a25a25c5f75d6cc512f2ba8c1546e6263e9ef8269f0c046c37838cc66aa83e6",
            ),
        ];

        for (secret, key1, key2, challenge) in vectors {
            let kdf = Kdf::derive_secrets_and_challenge(&unhex32(secret), true);
            assert_eq!(kdf.recv_secret, unhex32(key1));
            assert_eq!(kdf.send_secret, unhex32(key2));
            assert_eq!(kdf.challenge, unhex32(challenge));
        }
    }

    #[test]
    fn greater_side_swaps_directional_keys() {
        let secret = unhex32("9fe4a5a73df12dbd8659b1d9280873fe993caefec6b0ebc2686dd65027148e03");
        let least = Kdf::derive_secrets_and_challenge(&secret, true);
        let greater = Kdf::derive_secrets_and_challenge(&secret, false);

        assert_eq!(least.recv_secret, greater.send_secret);
        assert_eq!(least.send_secret, greater.recv_secret);
        assert_eq!(least.challenge, greater.challenge);
    }
}
