use clap::Parser;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{self, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use campus_client_core::api::{ApiClient, ApiConfig, ApiError, Method};
use campus_client_core::cli::{Cli, Command};
use campus_client_core::config;
use campus_client_core::drafts::{DraftSaver, DraftStore, JsonDraftStore};
use campus_client_core::epoch::EpochTracker;
use campus_client_core::error::CliError;
use campus_client_core::guard::{NavigationCheck, UnsavedChangesGuard};
use campus_client_core::realtime::{ChannelState, RealtimeClient};
use campus_client_core::resource::{
    EditSession, ForceError, SaveOutcome, version_from_body,
};
use campus_client_core::submit::{SubmissionCoordinator, SubmitError, SubmitFailure};
use campus_client_core::telemetry::logging;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    logging::init(&cli.logging.to_config()).map_err(|err| CliError::Logging(err.to_string()))?;

    let server = config::normalize_server(cli.server.clone());
    let api_config = ApiConfig::new(&server)?.with_bearer_token(cli.access_token.clone());
    let client = ApiClient::new(api_config)?;

    match cli.command {
        Command::Watch { thread_id } => watch(client, &thread_id).await,
        Command::Reply { thread_id, message } => reply(client, &thread_id, message).await,
        Command::Notes {
            course_id,
            body,
            force,
        } => notes(client, &course_id, body, force).await,
    }
}

async fn watch(client: ApiClient, thread_id: &str) -> Result<(), CliError> {
    // The initial load runs under an epoch so a superseded fetch could never
    // land; the CLI has a single page, but the discipline is the same.
    let tracker = EpochTracker::new();
    let epoch = tracker.begin();
    let thread = tracker
        .run_latest(
            &epoch,
            client.get(&format!("/threads/{thread_id}"), Some(epoch.token())),
        )
        .await?;
    if let Some(thread) = thread {
        let title = thread
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or(thread_id);
        println!("following: {title}");
    }

    let realtime = RealtimeClient::new(client.config().realtime_url()?);
    realtime.connect().await?;
    realtime.await_connected().await;

    let topic = format!("thread-{thread_id}");
    let _subscription = realtime.subscribe(&topic).await?;
    let _registration = realtime.on_message("new_reply", |event| {
        let author = event
            .entity
            .get("author")
            .and_then(|v| v.as_str())
            .unwrap_or("someone");
        let body = event
            .entity
            .get("body")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        println!("{author}: {body}");
    });

    // Stay on the channel; if the server drops us, re-establish and
    // re-subscribe the topic we are still holding.
    let mut state = realtime.state_watch();
    loop {
        if state.changed().await.is_err() {
            break;
        }
        if *state.borrow() == ChannelState::Disconnected {
            eprintln!("connection lost; reconnecting…");
            realtime.ensure_connected().await?;
        }
    }
    Ok(())
}

async fn reply(
    client: ApiClient,
    thread_id: &str,
    message: Option<String>,
) -> Result<(), CliError> {
    let store: Arc<dyn DraftStore> = Arc::new(JsonDraftStore::new()?);
    let saver = DraftSaver::new(store.clone());
    let draft_key = format!("thread-{thread_id}-reply");

    let body_text = match message {
        Some(text) => text,
        None => match store.load(&draft_key).await? {
            Some(draft) => {
                eprintln!("resuming saved draft");
                draft.fields.get("body").cloned().unwrap_or_default()
            }
            None => {
                return Err(CliError::InvalidArgument(
                    "no message given and no saved draft for this thread".into(),
                ));
            }
        },
    };
    // Keep the draft durable until the submission actually lands.
    saver
        .flush(
            &draft_key,
            BTreeMap::from([("body".to_string(), body_text.clone())]),
        )
        .await?;

    let unsaved = Arc::new(AtomicBool::new(true));
    let unsaved_flag = unsaved.clone();
    let guard = UnsavedChangesGuard::new("Your reply has not been posted yet.", move || {
        unsaved_flag.load(Ordering::SeqCst)
    });

    let coordinator = SubmissionCoordinator::new();
    let path = format!("/threads/{thread_id}/replies");
    let submit_client = client.clone();
    let mut outcome = coordinator
        .submit(body_text, move |body: String| {
            let client = submit_client.clone();
            let path = path.clone();
            async move { client.write(Method::Post, &path, json!({ "body": body }), None).await }
        })
        .await;

    loop {
        match outcome {
            Ok(response) => {
                // Flip the predicate before any navigation the success path
                // performs, or the guard would block it.
                unsaved.store(false, Ordering::SeqCst);
                saver.clear(&draft_key).await?;
                let id = response.get("id").and_then(|v| v.as_str()).unwrap_or("?");
                println!("reply {id} posted");
                return Ok(());
            }
            Err(SubmitError::Failed(SubmitFailure::Network(reason))) => {
                eprintln!("could not reach the server ({reason}); your text is kept");
                if prompt("retry now? [y/N] ")? == "y" {
                    outcome = coordinator.retry().await;
                    continue;
                }
                match guard.check("exit") {
                    NavigationCheck::Confirm(pending) => {
                        eprintln!("{}", pending.message());
                        eprintln!("draft saved; run `campus reply {thread_id}` to retry later");
                        pending.confirm();
                    }
                    NavigationCheck::Proceed { .. } => {}
                }
                return Ok(());
            }
            Err(SubmitError::Failed(SubmitFailure::Validation(errors))) => {
                eprintln!("the server rejected the reply: {errors}");
                eprintln!("edit the draft and resubmit; nothing was lost");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn notes(
    client: ApiClient,
    course_id: &str,
    body: String,
    force: bool,
) -> Result<(), CliError> {
    let path = format!("/courses/{course_id}/notes");
    let current = client.get(&path, None).await?;
    let version = version_from_body(&current).ok_or_else(|| {
        CliError::Api(ApiError::InvalidResponse(
            "notes response carries no version stamp".into(),
        ))
    })?;

    let mut session = EditSession::new(version, current);
    session.mark_dirty();

    let save_client = client.clone();
    let save_path = path.clone();
    let new_body = body.clone();
    let outcome = session
        .save(move |version| {
            let client = save_client.clone();
            let path = save_path.clone();
            let body = new_body.clone();
            async move {
                client
                    .save_versioned(Method::Put, &path, json!({ "body": body }), &version)
                    .await
            }
        })
        .await?;

    let record = match outcome {
        SaveOutcome::Saved(version) => {
            println!("notes saved (version {version})");
            return Ok(());
        }
        SaveOutcome::Conflict(record) => record,
    };

    eprintln!(
        "someone edited these notes concurrently: server holds version {}",
        record.server_version
    );
    if let Some(server_body) = record.server_snapshot.get("body").and_then(|v| v.as_str()) {
        eprintln!("server copy:\n  {server_body}");
    }

    let decision = if force {
        "f".to_string()
    } else {
        prompt("[f]orce your edit, [d]iscard it and keep theirs, [a]bort? ")?
    };
    match decision.as_str() {
        "f" => {
            let save_client = client.clone();
            let outcome = session
                .force(move |version| {
                    let client = save_client.clone();
                    let path = path.clone();
                    let body = body.clone();
                    async move {
                        client
                            .save_versioned(Method::Put, &path, json!({ "body": body }), &version)
                            .await
                    }
                })
                .await
                .map_err(|err| match err {
                    ForceError::Save(api) => CliError::Api(api),
                    ForceError::Resolve(resolve) => CliError::InvalidArgument(resolve.to_string()),
                })?;
            match outcome {
                SaveOutcome::Saved(version) => println!("overwrote; notes now at version {version}"),
                SaveOutcome::Conflict(record) => eprintln!(
                    "another edit landed first (version {}); giving up",
                    record.server_version
                ),
            }
        }
        "d" => {
            session
                .discard()
                .map_err(|err| CliError::InvalidArgument(err.to_string()))?;
            println!("kept the server's version; your edit was dropped");
        }
        _ => eprintln!("left unresolved; nothing was saved"),
    }
    Ok(())
}

fn prompt(message: &str) -> Result<String, CliError> {
    let mut stderr = io::stderr();
    write!(stderr, "{message}")?;
    stderr.flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_lowercase())
}
