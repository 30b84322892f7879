//! gateway_sign - print the `Authorization` header for a signed document

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::RngCore;
use zeroize::Zeroizing;

use quantum_gateway::auth::{sign_request, SigningVersion};
use quantum_gateway::now_ms;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Shared HMAC secret, hex encoded.
    #[arg(long, env = "QGATE_SECRET_HEX", hide_env_values = true)]
    secret_hex: String,
    /// HTTP method of the request being signed.
    #[arg(long, default_value = "POST")]
    method: String,
    /// Request path, without query string.
    #[arg(long, default_value = "/intents")]
    path: String,
    /// Signing version (v1|v2).
    #[arg(long, default_value = "v1")]
    version: String,
    /// Signed document given inline.
    #[arg(long, conflicts_with = "body_file")]
    body: Option<String>,
    /// Signed document read from a file.
    #[arg(long)]
    body_file: Option<std::path::PathBuf>,
    /// Unix timestamp in milliseconds; defaults to now.
    #[arg(long)]
    timestamp: Option<i64>,
    /// Nonce; defaults to 16 random bytes, hex encoded.
    #[arg(long)]
    nonce: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let secret = Zeroizing::new(
        hex::decode(args.secret_hex.trim()).map_err(|_| anyhow!("--secret-hex is not valid hex"))?,
    );
    let version: SigningVersion = args
        .version
        .parse()
        .map_err(|_| anyhow!("--version must be v1 or v2"))?;
    let body = match (args.body, args.body_file) {
        (Some(body), _) => body.into_bytes(),
        (None, Some(path)) => std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => return Err(anyhow!("one of --body or --body-file is required")),
    };
    let timestamp = args.timestamp.unwrap_or(now_ms() as i64);
    let nonce = args.nonce.unwrap_or_else(|| {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    });

    let header = sign_request(
        &secret,
        version,
        &args.method.to_ascii_uppercase(),
        &args.path,
        timestamp,
        &nonce,
        &body,
    );
    println!("Authorization: {header}");
    Ok(())
}
