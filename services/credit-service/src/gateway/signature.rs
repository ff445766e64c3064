//! Payment signatures: hex(HMAC-SHA256(secret, "<gateway_order_id>|<gateway_payment_id>")).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Keyed with the server-side secret; never serialized or logged.
#[derive(Clone)]
pub struct PaymentSigner {
    keyed: HmacSha256,
}

impl std::fmt::Debug for PaymentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentSigner").finish_non_exhaustive()
    }
}

impl PaymentSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            keyed: <HmacSha256 as Mac>::new_from_slice(secret.as_ref())?,
        })
    }

    fn mac(&self, gateway_order_id: &str, gateway_payment_id: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(gateway_order_id.as_bytes());
        mac.update(b"|");
        mac.update(gateway_payment_id.as_bytes());
        mac
    }

    /// Lowercase hex signature, as the gateway hands it to the client.
    pub fn sign(&self, gateway_order_id: &str, gateway_payment_id: &str) -> String {
        hex::encode(
            self.mac(gateway_order_id, gateway_payment_id)
                .finalize()
                .into_bytes(),
        )
    }

    /// Constant-time check of a client-supplied signature. Only the exact
    /// lowercase hex produced by [`Self::sign`] matches; no trimming or case
    /// folding.
    pub fn verify(&self, gateway_order_id: &str, gateway_payment_id: &str, signature: &str) -> bool {
        if !signature.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return false;
        }
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        self.mac(gateway_order_id, gateway_payment_id)
            .verify_slice(&provided)
            .is_ok()
    }
}
