//! Demo CLI: registers a bundle, accepts `message NAME TEXT` commands, and
//! prints inbound text — enough surface to exercise the whole key-agreement
//! core end to end. The per-message ratchet and AEAD framing are out of
//! scope; this demo carries the plaintext straight in the `ciphertext` wire
//! field alongside the handshake header, so the handover contract
//! (`RatchetSeed`) has somewhere concrete to land.

use anyhow::{Context, Result};
use client::{AuthGate, BundleReconciler, Config, DirectoryClient, PeerBundleFetcher, SessionManager, SqliteSecretStore, Label};
use nom::bytes::complete::tag;
use nom::character::complete::{alphanumeric1, multispace1};
use nom::sequence::preceded;
use nom::IResult;
use proto::service::brongnal_client::BrongnalClient;
use proto::service::X3dhMessage;
use std::env;
use std::io::{stdin, BufRead, BufReader};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio_rusqlite::Connection;

#[derive(Debug)]
struct Command {
    to: String,
    msg: String,
}

fn parse_command(input: &str) -> IResult<&str, Command> {
    let (input, _) = preceded(tag("message"), multispace1)(input)?;
    let (input, name) = alphanumeric1(input)?;
    let (message, _spaces) = multispace1(input)?;
    Ok((
        "",
        Command {
            to: name.to_owned(),
            msg: message.to_owned(),
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = env::args().collect::<Vec<String>>();
    let name = args.get(1).context("usage: client NAME [ADDR]")?.to_owned();
    let addr = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "https://signal.brongan.com:443".to_owned());

    eprintln!("Registering {name} at {addr}");

    let stub = BrongnalClient::connect(addr).await?;
    let config = Config::default();

    let connection = Connection::open(format!("{name}.secrets.db3")).await?;
    let store = SqliteSecretStore::open(connection).await?;

    let directory = DirectoryClient::new(stub, name.clone(), &config)?;
    let reconciler = BundleReconciler::new(store.clone(), directory.clone(), config.clone());
    let fetcher = PeerBundleFetcher::new(directory.clone(), config.clone());
    let sessions = SessionManager::new(store.clone(), Arc::new(fetcher), name.clone());

    let gate = AuthGate::new(&reconciler, &sessions);
    gate.on_authenticated().await?;

    println!("message NAME MESSAGE");

    let (tx, mut rx) = mpsc::channel::<(String, Vec<u8>)>(100);
    let (cli_tx, mut cli_rx) = mpsc::unbounded_channel::<Command>();

    thread::spawn(move || {
        for line in BufReader::new(stdin()).lines() {
            let Ok(line) = line else { return };
            match parse_command(&line) {
                Ok((_, command)) => {
                    if cli_tx.send(command).is_err() {
                        return;
                    }
                }
                Err(e) => eprintln!("Invalid command: {e}"),
            }
        }
    });

    {
        let directory = directory.clone();
        tokio::spawn(async move {
            if let Err(err) = listen(directory, tx).await {
                eprintln!("Listener stopped: {err}");
            }
        });
    }

    loop {
        tokio::select! {
            command = cli_rx.recv() => {
                match command {
                    Some(command) => {
                        if let Err(err) = send(&store, &sessions, &directory, &command.to, command.msg.as_bytes()).await {
                            eprintln!("Failed to send to {}: {err}", command.to);
                        }
                    }
                    None => {
                        eprintln!("Closing...");
                        return Ok(());
                    }
                }
            }
            received = rx.recv() => {
                match received {
                    Some((from, bytes)) => {
                        println!("{from}: {}", String::from_utf8_lossy(&bytes));
                    }
                    None => {
                        eprintln!("Server terminated connection.");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn send(
    store: &SqliteSecretStore,
    sessions: &SessionManager,
    directory: &DirectoryClient,
    to: &str,
    plaintext: &[u8],
) -> Result<()> {
    let seed = sessions.session_for(to).await?;
    let sender_identity_key = store
        .get(Label::IdentityPub)
        .await?
        .context("identity not yet generated; AuthGate::on_authenticated must run first")?;

    let message = X3dhMessage {
        sender_identity: directory.own_identity().to_owned(),
        sender_identity_key,
        sender_identity_dh_key: seed.local_identity_dh_public.as_bytes().to_vec(),
        ephemeral_key: seed.ephemeral_public.as_bytes().to_vec(),
        one_time_key_id: seed.otpk_id,
        ciphertext: plaintext.to_vec(),
    };
    directory.send_message(to, message).await?;
    println!("Message sent to {to}.");
    Ok(())
}

async fn listen(directory: DirectoryClient, tx: mpsc::Sender<(String, Vec<u8>)>) -> Result<()> {
    let mut stream = directory.retrieve_messages().await?;
    while let Some(message) = stream.message().await? {
        tx.send((message.sender_identity.clone(), message.ciphertext))
            .await?;
    }
    Ok(())
}
