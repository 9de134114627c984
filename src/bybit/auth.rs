use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// How long a WebSocket auth signature stays valid, ms.
const WS_AUTH_TTL_MS: i64 = 10_000;

#[derive(Clone)]
pub struct BybitAuth {
    api_key: String,
    api_secret: String,
}

impl BybitAuth {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self { api_key, api_secret }
    }

    pub fn get_api_key(&self) -> &str {
        &self.api_key
    }

    fn hmac_hex(&self, payload: &str) -> String {
        // HMAC accepts keys of any length
        match HmacSha256::new_from_slice(self.api_secret.as_bytes()) {
            Ok(mut mac) => {
                mac.update(payload.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            Err(_) => String::new(),
        }
    }

    /// REST signature over `timestamp + api_key + recv_window + params`,
    /// where params is the query string (GET) or the JSON body (POST).
    pub fn generate_signature(&self, timestamp: i64, recv_window: u64, params: &str) -> String {
        self.hmac_hex(&format!("{}{}{}{}", timestamp, self.api_key, recv_window, params))
    }

    /// `auth` op arguments for the private stream: (key, expires, signature).
    pub fn generate_ws_auth(&self) -> (String, String, String) {
        let expires = chrono::Utc::now().timestamp_millis() + WS_AUTH_TTL_MS;
        let signature = self.hmac_hex(&format!("GET/realtime{}", expires));
        (self.api_key.clone(), expires.to_string(), signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_generation() {
        let auth = BybitAuth::new("test_key".to_string(), "test_secret".to_string());
        let signature = auth.generate_signature(1234567890000, 5000, "category=linear&symbol=BTCUSDT");

        assert_eq!(signature.len(), 64);
        // Deterministic for identical input
        assert_eq!(
            signature,
            auth.generate_signature(1234567890000, 5000, "category=linear&symbol=BTCUSDT")
        );
        assert_ne!(signature, auth.generate_signature(1234567890000, 5000, "category=linear"));
    }

    #[test]
    fn test_ws_auth_generation() {
        let auth = BybitAuth::new("test_key".to_string(), "test_secret".to_string());
        let (api_key, expires, signature) = auth.generate_ws_auth();

        assert_eq!(api_key, "test_key");
        assert!(expires.parse::<i64>().unwrap() > chrono::Utc::now().timestamp_millis());
        assert_eq!(signature.len(), 64);
    }
}
