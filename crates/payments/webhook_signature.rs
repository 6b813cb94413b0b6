use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("stripe-signature header is missing or malformed")]
    MalformedHeader,
    #[error("signature timestamp {timestamp} is outside the {tolerance_secs}s tolerance")]
    TimestampOutsideTolerance { timestamp: i64, tolerance_secs: i64 },
    #[error("no v1 signature matches the payload")]
    Mismatch,
}

/// Verifies `Stripe-Signature` headers. https://stripe.com/docs/webhooks/signatures
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: String, tolerance_secs: i64) -> Self {
        Self {
            secret,
            tolerance_secs,
        }
    }

    /// Checks the header against the raw, unparsed payload bytes.
    pub fn verify(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<Vec<u8>> = Vec::new();

        for part in signature_header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => {
                    timestamp = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| SignatureError::MalformedHeader)?,
                    )
                }
                // Undecodable entries can never match; other schemes (v0) are ignored.
                "v1" => {
                    if let Ok(signature) = hex::decode(value) {
                        signatures.push(signature);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
        if signatures.is_empty() {
            return Err(SignatureError::MalformedHeader);
        }

        // `t` is still unauthenticated here and may hold any i64.
        if now.timestamp().abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            return Err(SignatureError::TimestampOutsideTolerance {
                timestamp,
                tolerance_secs: self.tolerance_secs,
            });
        }

        let matched = signatures.iter().any(|signature| {
            // `verify_slice` compares in constant time.
            self.mac_for(timestamp, payload)
                .is_some_and(|mac| mac.verify_slice(signature).is_ok())
        });

        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Builds a header the way Stripe would. Used by tests and local tooling.
    pub fn signature_header(&self, payload: &[u8], timestamp: i64) -> String {
        let signature = self
            .mac_for(timestamp, payload)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default();
        format!("t={timestamp},v1={signature}")
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).ok()?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Some(mac)
    }
}
