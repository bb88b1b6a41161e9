//! `ebill storage` - object store operations against the platform bucket

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ebill_storage::{
    BundlingPipeline, DeleteReport, LifecyclePolicyManager, ObjectStoreClient, SignedUrlGrant,
    StorageError,
};
use serde_json::json;

use super::load_config;

#[derive(Parser, Debug)]
#[command(about = "Object store operations against the platform bucket")]
pub struct StorageArgs {
    /// Bucket to operate on (default: storage.bucket, else the per-project bucket)
    #[arg(long, global = true, env = "EBILL_BUCKET")]
    pub bucket: Option<String>,

    #[command(subcommand)]
    pub command: StorageCommand,
}

#[derive(Subcommand, Debug)]
pub enum StorageCommand {
    /// List object keys
    Ls {
        /// Only keys starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Check whether an object exists
    Exists {
        /// Object key
        key: String,
    },
    /// Upload a local file
    Upload {
        /// Local file to upload
        file: PathBuf,
        /// Object key (default: the file name)
        #[arg(long)]
        key: Option<String>,
        /// Content type stored with the object
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
    },
    /// Issue a time-limited download URL
    Sign {
        /// Object key
        key: String,
        /// Validity in minutes (default: storage.signed_url_minutes)
        #[arg(long)]
        minutes: Option<u32>,
        /// Serve the file inline instead of as a download
        #[arg(long)]
        inline: bool,
        /// Print the grant as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete objects, reporting each key's outcome
    Delete {
        /// Object keys
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Zip objects into one archive and issue a download URL for it
    Bundle {
        /// Object keys to include
        #[arg(required = true)]
        keys: Vec<String>,
        /// Validity of the URL in minutes (default: storage.signed_url_minutes)
        #[arg(long)]
        minutes: Option<u32>,
        /// Print the grant as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply the bucket's retention rules
    Lifecycle {
        /// Print the current rules instead of applying
        #[arg(long)]
        show: bool,
    },
}

pub async fn run_storage(args: StorageArgs) -> Result<()> {
    let config = load_config()?;
    let client = ObjectStoreClient::from_config(&config.storage)
        .context("Failed to create object store client")?;
    let bucket = args.bucket.unwrap_or_else(|| {
        config
            .storage
            .bucket_name(client.project_id().unwrap_or_default())
    });
    let default_minutes = config.storage.signed_url_minutes;

    match args.command {
        StorageCommand::Ls { prefix } => {
            for key in client.list_keys(&bucket, prefix.as_deref()).await? {
                println!("{key}");
            }
        }
        StorageCommand::Exists { key } => {
            println!("{}", client.exists(&bucket, &key).await?);
        }
        StorageCommand::Upload {
            file,
            key,
            content_type,
        } => {
            let key = match key {
                Some(key) => key,
                None => file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .with_context(|| format!("Cannot derive a key from {}", file.display()))?,
            };
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let key = client
                .upload_buffer(&bucket, data, &key, &content_type)
                .await?;
            println!("gs://{bucket}/{key}");
        }
        StorageCommand::Sign {
            key,
            minutes,
            inline,
            json,
        } => {
            let grant = client
                .generate_signed_url(&bucket, &key, minutes.unwrap_or(default_minutes), !inline)
                .await?;
            print_grant(&grant, json);
        }
        StorageCommand::Delete { keys } => match client.delete_many(&bucket, &keys).await {
            Ok(report) => print_delete_report(&report),
            Err(StorageError::BulkDelete(report)) => {
                print_delete_report(&report);
                bail!("{} of {} deletions failed", report.failed.len(), report.total());
            }
            Err(err) => return Err(err.into()),
        },
        StorageCommand::Bundle { keys, minutes, json } => {
            let pipeline = BundlingPipeline::from_config(client, &config.storage)?;
            let grant = pipeline
                .create_qr_zip_and_signed_url(&bucket, &keys, minutes.unwrap_or(default_minutes))
                .await
                .context("Failed to bundle objects")?;
            print_grant(&grant, json);
        }
        StorageCommand::Lifecycle { show } => {
            if show {
                let stored = client.lifecycle_policy(&bucket).await?;
                println!("{stored:#}");
            } else {
                let outcome = LifecyclePolicyManager::default()
                    .apply(&client, &bucket)
                    .await?;
                println!("{bucket}: {outcome:?}");
            }
        }
    }
    Ok(())
}

fn print_grant(grant: &SignedUrlGrant, as_json: bool) {
    if as_json {
        let value = json!({
            "url": grant.url,
            "method": grant.method,
            "issued_at": grant.issued_at.to_rfc3339(),
            "expires_at": grant.expires_at.to_rfc3339(),
            "content_disposition": grant.content_disposition,
        });
        println!("{value:#}");
    } else {
        println!("{}", grant.url);
    }
}

fn print_delete_report(report: &DeleteReport) {
    for key in &report.deleted {
        println!("deleted  {key}");
    }
    for failure in &report.failed {
        let status = if failure.missing { "missing" } else { "failed" };
        println!("{status:<8} {}: {}", failure.key, failure.reason);
    }
}
