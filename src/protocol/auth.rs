//! Password authentication
//!
//! SASL SCRAM-SHA-256 (RFC 5802, RFC 7677) and the legacy MD5 challenge.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name announced by the server in AuthenticationSASL.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Answer to AuthenticationMD5Password:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    /// Auth message for signature verification
    auth_message: Option<String>,
    /// Salted password (cached for verification)
    salted_password: Option<Vec<u8>>,
}

impl ScramClient {
    /// Create a new SCRAM client with a random 24-character nonce.
    pub fn new(username: &str, password: &str) -> Self {
        const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::rng();
        let nonce: String = (0..24)
            .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
            .collect();
        Self::with_nonce(username, password, nonce)
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            auth_message: None,
            salted_password: None,
        }
    }

    /// Generate the client-first-message.
    ///
    /// Format: `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        // GS2 header "n,," (no channel binding)
        format!("n,,{}", self.client_first_message_bare()).into_bytes()
    }

    fn client_first_message_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// Process the server-first-message (`r=<nonce>,s=<salt>,i=<iterations>`)
    /// and produce the client-final-message.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, String> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| "Invalid UTF-8 in server message")?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_str.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| "Invalid salt base64")?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| "Invalid iteration count")?,
                );
            }
        }

        let nonce = nonce.ok_or("Missing nonce in server message")?;
        let salt = salt.ok_or("Missing salt in server message")?;
        let iterations = iterations.ok_or("Missing iterations in server message")?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err("Server nonce doesn't contain client nonce".to_string());
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);

        // biws = base64("n,,")
        let client_final_without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare(),
            server_str,
            client_final_without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.salted_password = Some(salted_password.to_vec());
        self.auth_message = Some(auth_message);

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(&client_proof)
        )
        .into_bytes())
    }

    /// Verify the server-final-message (`v=<signature>`).
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), String> {
        let server_str = std::str::from_utf8(server_msg)
            .map_err(|_| "Invalid UTF-8 in server final message")?;

        if let Some(err) = server_str.strip_prefix("e=") {
            return Err(format!("Server rejected authentication: {}", err));
        }

        let verifier = server_str
            .strip_prefix("v=")
            .ok_or("Missing verifier in server final message")?;
        let expected_signature = BASE64
            .decode(verifier)
            .map_err(|_| "Invalid base64 in server signature")?;

        let salted_password = self
            .salted_password
            .as_ref()
            .ok_or("Missing salted password")?;
        let auth_message = self.auth_message.as_ref().ok_or("Missing auth message")?;

        let server_key = hmac(salted_password, b"Server Key")?;
        let computed_signature = hmac(&server_key, auth_message.as_bytes())?;

        if computed_signature != expected_signature {
            return Err("Server signature verification failed".to_string());
        }
        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| e.to_string())?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
