// src/main.rs

//! # Civic Sign Client - Command Line Entry Point
//!
//! Logs the user in through the identity provider, exchanges a signed nonce
//! for an authentication token, and lists the credentials stored for the
//! logged-in principal.
//!
//! ## Configuration
//! See [`civic_sign_client::config`]: `civic_client.toml`, `CIVIC_*` variables
//! or a `.env` file. `RUST_LOG` controls verbosity.

use anyhow::{Context, Result};
use civic_sign_client::models::issuance::CredentialError;
use civic_sign_client::services::signer::HttpProofSigner;
use civic_sign_client::services::verifier::HttpVerificationBackend;
use civic_sign_client::utils::serialization::encode;
use civic_sign_client::{
    cancel_pair, ClientConfig, CredentialService, HttpIssuerBackend, LoopbackIdentityProvider, PrincipalService,
    ProofExchange, ServiceError,
};
use dotenv::dotenv;
use log::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = ClientConfig::load().context("Failed to load client configuration")?;

    let provider = LoopbackIdentityProvider::new(
        &config.identity_provider_url,
        config.callback_port,
        config.login_timeout(),
    )
    .context("Failed to set up the identity provider")?;
    let principals = PrincipalService::new(provider);

    let verifier = HttpVerificationBackend::new(&config.verification_url, config.request_timeout())
        .context("Failed to set up the verification backend client")?;
    let signer = HttpProofSigner::new(&config.signer_url, config.request_timeout())
        .context("Failed to set up the proof signer client")?;

    // Ctrl-C aborts whatever the exchange is waiting on.
    let (cancel_handle, cancel_signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel_handle.cancel();
        }
    });

    let token = ProofExchange::new(&principals, &verifier, &signer, config.exchange_settings())
        .with_cancel(cancel_signal)
        .run()
        .await
        .context("Proof exchange failed")?;
    println!("Authenticated ({:?} token, {} bytes)", token.algorithm(), token.as_str().len());

    let principal = principals
        .request_principal()
        .await
        .context("Lost the login session")?;
    let issuer_backend = HttpIssuerBackend::new(&config.issuer_url, config.request_timeout())
        .context("Failed to set up the issuer backend client")?
        .with_bearer_token(&token);
    let credentials = CredentialService::new(issuer_backend, principal.clone());
    match credentials.get_credentials(&principal).await {
        Ok(stored) => {
            info!("{} credentials stored for {}", stored.len(), principal);
            println!("{}", encode(&stored).context("Failed to render credentials")?);
        }
        Err(ServiceError::Credential(CredentialError::NoCredentialsFound(_))) => {
            println!("No credentials stored for {}", principal.did());
        }
        Err(e) => return Err(e).context("Failed to list credentials"),
    }

    Ok(())
}
