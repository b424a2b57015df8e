use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::error::AppError;
use crate::ids::{DocumentId, RoomKey, UserId};

const DEFAULT_ISSUER: &str = "tandem";
const DEFAULT_TTL: Duration = Duration::minutes(15);

/// Issues and verifies the signed tickets a client presents when opening a
/// websocket. A ticket names one user and one document; every room of that
/// document (main or branch) is reachable with it.
#[derive(Clone)]
pub struct TicketIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    issuer: String,
}

#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketSubject {
    pub document: DocumentId,
    pub user: UserId,
    pub expires_at: i64,
}

impl TicketSubject {
    pub fn permits(&self, room: &RoomKey) -> Result<(), AppError> {
        if room.document == self.document {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "ticket for document {} does not grant access to {}",
                self.document, room
            )))
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct JoinClaims {
    sub: String,
    doc: u64,
    exp: i64,
    iat: i64,
    iss: String,
}

impl TicketIssuer {
    pub fn new(secret: &[u8], ttl: Duration, issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub"]);
        validation.set_issuer(&[issuer.clone()]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
            issuer,
        }
    }

    pub fn from_env_or_generate() -> Self {
        let secret = match std::env::var("TANDEM_TICKET_SECRET") {
            Ok(value) if !value.is_empty() => value.into_bytes(),
            _ => {
                warn!(
                    "TANDEM_TICKET_SECRET not set; tickets are signed with an ephemeral secret \
                     and become invalid when the process restarts"
                );
                Self::generate_secret()
            }
        };

        Self::new(&secret, DEFAULT_TTL, DEFAULT_ISSUER)
    }

    pub fn development() -> Self {
        Self::new(&Self::generate_secret(), DEFAULT_TTL, DEFAULT_ISSUER)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, document: DocumentId, user: &UserId) -> Result<IssuedTicket, AppError> {
        if user.as_str().trim().is_empty() {
            return Err(AppError::InvalidInput("user_id cannot be empty".to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let claims = JoinClaims {
            sub: user.as_str().to_string(),
            doc: document.as_u64(),
            exp: (now + self.ttl).unix_timestamp(),
            iat: now.unix_timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedTicket {
            token,
            expires_at: claims.exp,
        })
    }

    pub fn validate(&self, token: &str) -> Result<TicketSubject, AppError> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidTicket("missing ticket".to_string()));
        }

        let data = decode::<JoinClaims>(trimmed, &self.decoding, &self.validation)
            .map_err(|err| AppError::InvalidTicket(err.to_string()))?;

        Ok(TicketSubject {
            document: data.claims.doc.into(),
            user: UserId(data.claims.sub),
            expires_at: data.claims.exp,
        })
    }

    fn generate_secret() -> Vec<u8> {
        let mut key = vec![0_u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }
}
