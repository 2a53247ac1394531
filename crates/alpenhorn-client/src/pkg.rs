//! PKG client: registration, status, and per-round key extraction.
//!
//! Each PKG holds one share of the IBE master secret and one attestation
//! key. The client registers its username and long-term key once per PKG,
//! then every add-friend round runs the extract handshake: a signed,
//! round-bound commitment carrying a fresh return key goes up; the PKG
//! answers with its identity private-key share sealed to the return key,
//! plus its BLS attestation over the identity binding. Sealing keeps the
//! share confidential in transit; the client unseals with the return
//! secret it kept.
//!
//! Transport failures are retryable at the engine level; cryptographic
//! failures are terminal for the round.

use alpenhorn_proto::ServerEntry;
use alpenhorn_crypto::{bls, ibe, onion, username_to_identity};
use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};

use crate::error::Error;

/// Registration state of an account on one PKG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// The account exists and is verified.
    Verified,
    /// The account exists but verification is pending.
    NotVerified,
    /// The PKG has never seen this username.
    NotRegistered,
}

/// Machine-readable error codes in PKG replies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PkgErrorCode {
    /// The username is already taken.
    AlreadyRegistered,
    /// The username is unknown.
    NotRegistered,
    /// The account has not completed verification.
    NotVerified,
    /// A signature failed to verify.
    InvalidSignature,
    /// The request was malformed.
    BadRequest,
    /// The round in the request is not the PKG's current round.
    RoundMismatch,
}

/// Error body returned by a PKG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkgError {
    /// Machine-readable code.
    pub code: PkgErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl From<PkgError> for Error {
    fn from(err: PkgError) -> Self {
        match err.code {
            PkgErrorCode::AlreadyRegistered => Error::AlreadyRegistered,
            PkgErrorCode::NotRegistered => Error::NotRegistered,
            PkgErrorCode::NotVerified => Error::NotVerified,
            PkgErrorCode::InvalidSignature => Error::Unauthorized(err.message),
            PkgErrorCode::BadRequest => Error::MalformedMessage(err.message),
            PkgErrorCode::RoundMismatch => Error::Unauthorized(err.message),
        }
    }
}

/// Signed arguments for `/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterArgs {
    /// Username to claim.
    pub username: String,
    /// Login verification key the account will authenticate with.
    #[serde(with = "hex")]
    pub login_key: [u8; 32],
    /// Long-term key the PKG will attest to.
    #[serde(with = "hex")]
    pub long_term_key: [u8; 32],
    /// Signature by the login key over the registration binding.
    #[serde(with = "hex")]
    pub signature: [u8; 64],
}

/// Signed arguments for `/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusArgs {
    /// Username to probe.
    pub username: String,
    /// Fresh random bytes so status probes cannot be replayed.
    #[serde(with = "hex")]
    pub message: [u8; 32],
    /// Signature by the login key.
    #[serde(with = "hex")]
    pub signature: [u8; 64],
}

/// Signed arguments for `/extract`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractArgs {
    /// Round the key is requested for.
    pub round: u32,
    /// Username whose identity key is being extracted.
    pub username: String,
    /// Fresh x25519 key the share must be sealed to.
    #[serde(with = "hex")]
    pub return_key: [u8; 32],
    /// Signature by the login key over the commitment.
    #[serde(with = "hex")]
    pub signature: [u8; 64],
}

/// Reply to `/extract`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractReply {
    /// Round the reply is for.
    pub round: u32,
    /// Identity private-key share, sealed to the request's return key.
    #[serde(with = "hex")]
    pub sealed_share: Vec<u8>,
    /// BLS attestation signature over the identity binding.
    #[serde(with = "hex")]
    pub attestation: [u8; 48],
}

/// The verified outcome of one extraction.
pub struct ExtractResult {
    /// This PKG's identity private-key share for the round.
    pub private_key_share: ibe::IdentityPrivateKey,
    /// This PKG's attestation signature share.
    pub attestation: bls::Signature,
}

/// How requests reach a PKG. HTTP in production, in-memory in tests.
#[async_trait]
pub trait PkgTransport: Send + Sync {
    /// POST `/register`.
    async fn register(&self, server: &ServerEntry, args: RegisterArgs) -> Result<(), Error>;
    /// POST `/status`.
    async fn status(&self, server: &ServerEntry, args: StatusArgs) -> Result<(), Error>;
    /// POST `/extract`.
    async fn extract(&self, server: &ServerEntry, args: ExtractArgs)
        -> Result<ExtractReply, Error>;
}

/// PKG transport over HTTPS with JSON bodies.
pub struct HttpPkgTransport {
    http: reqwest::Client,
}

impl HttpPkgTransport {
    /// Create a transport with a fresh connection pool.
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        server: &ServerEntry,
        endpoint: &str,
        body: &impl Serialize,
    ) -> Result<T, Error> {
        let url = format!("https://{}{endpoint}", server.address);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let err = response
                .json::<PkgError>()
                .await
                .map_err(|e| Error::Transport(format!("unreadable PKG error: {e}")))?;
            return Err(err.into());
        }
        response.json::<T>().await.map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

impl Default for HttpPkgTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct EmptyReply {}

#[async_trait]
impl PkgTransport for HttpPkgTransport {
    async fn register(&self, server: &ServerEntry, args: RegisterArgs) -> Result<(), Error> {
        self.post::<EmptyReply>(server, "/register", &args).await.map(|_| ())
    }

    async fn status(&self, server: &ServerEntry, args: StatusArgs) -> Result<(), Error> {
        self.post::<EmptyReply>(server, "/status", &args).await.map(|_| ())
    }

    async fn extract(
        &self,
        server: &ServerEntry,
        args: ExtractArgs,
    ) -> Result<ExtractReply, Error> {
        self.post(server, "/extract", &args).await
    }
}

/// Client for one (PKG server, user) pair.
pub struct PkgClient<'a> {
    /// The PKG being talked to.
    pub server: ServerEntry,
    /// Username being registered or extracted for.
    pub username: &'a str,
    /// Login signing key authenticating the account.
    pub login_key: &'a SigningKey,
    /// Long-term public key the PKG attests to.
    pub long_term_key: [u8; 32],
}

/// Binding messages signed by the login key. Each carries the server's key
/// so a signature for one PKG cannot be replayed at another.
fn register_message(server: &ServerEntry, args: &RegisterArgs) -> Vec<u8> {
    let mut msg = b"AlpenhornPKGRegister".to_vec();
    msg.extend_from_slice(&server.key);
    msg.extend_from_slice(args.username.as_bytes());
    msg.push(0);
    msg.extend_from_slice(&args.login_key);
    msg.extend_from_slice(&args.long_term_key);
    msg
}

fn status_message(server: &ServerEntry, username: &str, message: &[u8; 32]) -> Vec<u8> {
    let mut msg = b"AlpenhornPKGStatus".to_vec();
    msg.extend_from_slice(&server.key);
    msg.extend_from_slice(username.as_bytes());
    msg.push(0);
    msg.extend_from_slice(message);
    msg
}

fn extract_message(server: &ServerEntry, round: u32, username: &str, return_key: &[u8; 32]) -> Vec<u8> {
    let mut msg = b"AlpenhornPKGExtract".to_vec();
    msg.extend_from_slice(&server.key);
    msg.extend_from_slice(&round.to_le_bytes());
    msg.extend_from_slice(username.as_bytes());
    msg.push(0);
    msg.extend_from_slice(return_key);
    msg
}

impl PkgClient<'_> {
    /// Register the account. `AlreadyRegistered` counts as success.
    pub async fn register(&self, transport: &dyn PkgTransport) -> Result<(), Error> {
        username_to_identity(self.username)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;

        let mut args = RegisterArgs {
            username: self.username.to_string(),
            login_key: self.login_key.verifying_key().to_bytes(),
            long_term_key: self.long_term_key,
            signature: [0u8; 64],
        };
        args.signature = self.login_key.sign(&register_message(&self.server, &args)).to_bytes();

        match transport.register(&self.server, args).await {
            Ok(()) | Err(Error::AlreadyRegistered) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Probe the account's registration state on this PKG.
    pub async fn check_status(&self, transport: &dyn PkgTransport) -> Result<RegistrationStatus, Error> {
        let mut message = [0u8; 32];
        OsRng.fill_bytes(&mut message);

        let signature = self
            .login_key
            .sign(&status_message(&self.server, self.username, &message))
            .to_bytes();
        let args = StatusArgs { username: self.username.to_string(), message, signature };

        match transport.status(&self.server, args).await {
            Ok(()) => Ok(RegistrationStatus::Verified),
            Err(Error::NotVerified) => Ok(RegistrationStatus::NotVerified),
            Err(Error::NotRegistered) => Ok(RegistrationStatus::NotRegistered),
            Err(err) => Err(err),
        }
    }

    /// Run the extract handshake for `round`.
    ///
    /// Verifies the reply is for the requested round and that the sealed
    /// share opens and decodes. The caller still must check the BLS
    /// attestation against the round's published keys before using the
    /// share.
    pub async fn extract(
        &self,
        transport: &dyn PkgTransport,
        round: u32,
    ) -> Result<ExtractResult, Error> {
        let return_secret = StaticSecret::random_from_rng(OsRng);
        let return_key = DhPublicKey::from(&return_secret).to_bytes();

        let signature = self
            .login_key
            .sign(&extract_message(&self.server, round, self.username, &return_key))
            .to_bytes();
        let args = ExtractArgs {
            round,
            username: self.username.to_string(),
            return_key,
            signature,
        };

        let reply = transport.extract(&self.server, args).await?;
        if reply.round != round {
            return Err(Error::RoundMismatch { expected: round, got: reply.round });
        }

        let (share_bytes, _) = onion::peel(&reply.sealed_share, &return_secret)
            .ok_or_else(|| Error::InvalidSignature("sealed key share did not open".to_string()))?;
        let share_bytes: [u8; ibe::PRIVATE_SHARE_SIZE] = share_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::MalformedMessage("key share has wrong length".to_string()))?;
        let private_key_share = ibe::IdentityPrivateKey::from_compressed(&share_bytes)
            .ok_or_else(|| Error::MalformedMessage("key share is not a curve point".to_string()))?;

        let attestation = bls::Signature::from_compressed(&reply.attestation)
            .ok_or_else(|| Error::MalformedMessage("attestation is not a curve point".to_string()))?;

        Ok(ExtractResult { private_key_share, attestation })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rand::rngs::OsRng;

    use super::*;

    /// A PKG implemented directly against the crypto crate.
    struct MockPkg {
        master: ibe::MasterSecretKey,
        bls: bls::SecretKey,
        registered: Mutex<Vec<String>>,
        round: u32,
    }

    impl MockPkg {
        fn new(round: u32) -> Self {
            Self {
                master: ibe::MasterSecretKey::generate(),
                bls: bls::SecretKey::generate(),
                registered: Mutex::new(Vec::new()),
                round,
            }
        }

        fn entry(&self) -> ServerEntry {
            ServerEntry {
                key: [0u8; 32],
                address: "pkg.example.org:443".to_string(),
            }
        }
    }

    #[async_trait]
    impl PkgTransport for MockPkg {
        async fn register(&self, _server: &ServerEntry, args: RegisterArgs) -> Result<(), Error> {
            let mut registered = self.registered.lock().unwrap();
            if registered.contains(&args.username) {
                return Err(Error::AlreadyRegistered);
            }
            registered.push(args.username);
            Ok(())
        }

        async fn status(&self, _server: &ServerEntry, args: StatusArgs) -> Result<(), Error> {
            if self.registered.lock().unwrap().contains(&args.username) {
                Ok(())
            } else {
                Err(Error::NotRegistered)
            }
        }

        async fn extract(
            &self,
            _server: &ServerEntry,
            args: ExtractArgs,
        ) -> Result<ExtractReply, Error> {
            if args.round != self.round {
                return Err(Error::RoundMismatch { expected: self.round, got: args.round });
            }
            let identity = username_to_identity(&args.username)
                .map_err(|e| Error::MalformedMessage(e.to_string()))?;
            let share = self.master.extract(&identity).to_compressed();
            let (sealed_share, _) = onion::seal(&share, &[args.return_key]);

            let attest_msg = bls::attestation_message(
                &self.bls.public_key(),
                &identity,
                &[7u8; 32],
            );
            Ok(ExtractReply {
                round: args.round,
                sealed_share,
                attestation: self.bls.sign(&attest_msg).to_compressed(),
            })
        }
    }

    fn client_for<'a>(username: &'a str, login_key: &'a SigningKey, pkg: &MockPkg) -> PkgClient<'a> {
        PkgClient {
            server: pkg.entry(),
            username,
            login_key,
            long_term_key: [7u8; 32],
        }
    }

    #[tokio::test]
    async fn register_then_status_verified() {
        let pkg = MockPkg::new(1);
        let login = SigningKey::generate(&mut OsRng);
        let client = client_for("alice", &login, &pkg);

        client.register(&pkg).await.unwrap();
        assert_eq!(client.check_status(&pkg).await.unwrap(), RegistrationStatus::Verified);
    }

    #[tokio::test]
    async fn double_registration_is_success() {
        let pkg = MockPkg::new(1);
        let login = SigningKey::generate(&mut OsRng);
        let client = client_for("alice", &login, &pkg);

        client.register(&pkg).await.unwrap();
        client.register(&pkg).await.unwrap();
    }

    #[tokio::test]
    async fn status_of_unknown_user() {
        let pkg = MockPkg::new(1);
        let login = SigningKey::generate(&mut OsRng);
        let client = client_for("ghost", &login, &pkg);

        assert_eq!(client.check_status(&pkg).await.unwrap(), RegistrationStatus::NotRegistered);
    }

    #[tokio::test]
    async fn extract_round_trip_yields_working_share() {
        let pkg = MockPkg::new(5);
        let login = SigningKey::generate(&mut OsRng);
        let client = client_for("alice", &login, &pkg);

        let result = client.extract(&pkg, 5).await.unwrap();

        // The share decrypts a message encrypted under this PKG's master key.
        let identity = username_to_identity("alice").unwrap();
        let master = ibe::MasterPublicKey::aggregate(&[pkg.master.public_key()]);
        let ct = ibe::encrypt(&mut OsRng, &master, &identity, b"probe");
        let full = ibe::IdentityPrivateKey::aggregate(&[result.private_key_share]);
        assert_eq!(ibe::decrypt(&full, &ct), Some(b"probe".to_vec()));

        // And the attestation verifies against the PKG's BLS key.
        let msg = bls::attestation_message(&pkg.bls.public_key(), &identity, &[7u8; 32]);
        assert!(bls::verify(&[pkg.bls.public_key()], &msg, &result.attestation));
    }

    #[tokio::test]
    async fn extract_for_wrong_round_is_rejected() {
        let pkg = MockPkg::new(5);
        let login = SigningKey::generate(&mut OsRng);
        let client = client_for("alice", &login, &pkg);

        let result = client.extract(&pkg, 6).await;
        assert!(matches!(result, Err(Error::RoundMismatch { expected: 6, got: 5 })));
    }

    #[tokio::test]
    async fn invalid_username_is_rejected_before_the_network() {
        let pkg = MockPkg::new(1);
        let login = SigningKey::generate(&mut OsRng);
        let client = client_for("Not A User", &login, &pkg);

        assert!(client.register(&pkg).await.is_err());
        assert!(pkg.registered.lock().unwrap().is_empty());
    }
}
