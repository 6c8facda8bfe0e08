//! Transcription gateway and provider clients.

pub mod assemblyai;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod signer;

pub use assemblyai::{AssemblyAiProvider, MAX_PROVIDER_CALL, WEBHOOK_AUTH_HEADER};
pub use error::{GatewayError, ProviderError, SignerError};
pub use gateway::{ApplyOutcome, SubmitOutcome, TranscriptionGateway};
pub use provider::{CallbackPayload, ProviderEvent, SubmitRequest, Submission, TranscriptionProvider};
pub use signer::{MediaClaims, MediaUrlSigner, SignedUrl};
