//! Quorumcast interactive client executable.
//!
//! Drives a `ClientStub` through a numbered menu. Replies and delivered
//! votes are printed by the stub's background listener as they arrive;
//! the menu itself only sends requests and casts ballots.

use std::io::Write as _;

use clap::Parser;

use tokio::io::{self, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::runtime::Builder;
use tokio::sync::watch;

use quorumcast::{
    logger_init, parsed_config, pf_info, ClientConfig, ClientStub,
    QuorumcastError,
};

/// Client executable arguments.
#[derive(Parser, Debug)]
#[command(name = "quorumcast_client")]
struct CliArgs {
    /// Config string in TOML format to override default tunables.
    #[arg(short, long)]
    config: Option<String>,
}

type StdinLines = Lines<BufReader<Stdin>>;

/// Reads one trimmed line, or `None` on shutdown/EOF.
async fn read_line(
    lines: &mut StdinLines,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<String> {
    tokio::select! {
        _ = shutdown.changed() => None,
        line = lines.next_line() => {
            line.ok().flatten().map(|l| l.trim().to_string())
        }
    }
}

async fn prompt(
    lines: &mut StdinLines,
    shutdown: &mut watch::Receiver<bool>,
    text: &str,
) -> Option<String> {
    print!("{}", text);
    let _ = std::io::stdout().flush();
    read_line(lines, shutdown).await
}

async fn start_vote_flow(
    stub: &ClientStub,
    lines: &mut StdinLines,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<()> {
    let name = prompt(lines, shutdown, "Group name: ").await?;
    let topic = prompt(lines, shutdown, "Topic: ").await?;

    let mut timeout = 30u64;
    let raw = prompt(lines, shutdown, "Timeout (s): ").await?;
    match raw.parse() {
        Ok(secs) => timeout = secs,
        Err(_) => println!("Invalid timeout, default={}", timeout),
    }

    let mut options = vec![];
    loop {
        let text = prompt(
            lines,
            shutdown,
            &format!("Option {} ('s' to stop): ", options.len() + 1),
        )
        .await?;
        if text == "s" {
            break;
        }
        if !text.is_empty() {
            options.push(text);
        }
    }

    if let Err(e) = stub.start_vote(&name, &topic, options, timeout).await {
        println!("Error: {}", e);
    }
    Some(())
}

async fn cast_vote_flow(
    stub: &ClientStub,
    lines: &mut StdinLines,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<()> {
    let votes = stub.pending_votes();
    if votes.is_empty() {
        println!("No pending votes");
        return Some(());
    }
    for (vote_id, info) in votes {
        println!("Vote ID: {}", vote_id);
        println!("  Group: {}", info.group);
        println!("  Topic: {}", info.topic);
        println!("  Options: {}", info.options.join(", "));
        println!("  Sender: {}", info.sender);
        loop {
            let choice = prompt(lines, shutdown, "Your vote: ").await?;
            match stub.cast_vote(&vote_id, &choice).await {
                Ok(()) => break,
                Err(e) => println!("{}", e),
            }
        }
    }
    Some(())
}

async fn menu(
    stub: ClientStub,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), QuorumcastError> {
    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        if *shutdown.borrow() {
            break;
        }
        println!();
        println!("--- Menu ---");
        println!("1) Show leader");
        println!("2) Show available groups");
        println!("3) Show joined groups");
        println!("4) Create group");
        println!("5) Join group");
        println!("6) Leave group");
        println!("7) Start vote");
        println!("8) Vote");
        println!("9) Exit");
        let Some(choice) = prompt(&mut lines, &mut shutdown, "Choose: ").await
        else {
            break;
        };

        let result = match choice.as_str() {
            "1" => {
                match stub.leader() {
                    Some(leader) => println!("Leader: {}", leader),
                    None => println!("No known leader"),
                }
                Ok(())
            }
            "2" => stub.get_groups().await,
            "3" => stub.joined_groups().await,
            "4" => match prompt(&mut lines, &mut shutdown, "Group name: ")
                .await
            {
                Some(name) => stub.create_group(&name).await,
                None => break,
            },
            "5" => match prompt(&mut lines, &mut shutdown, "Group name: ")
                .await
            {
                Some(name) => stub.join_group(&name).await,
                None => break,
            },
            "6" => match prompt(&mut lines, &mut shutdown, "Group name: ")
                .await
            {
                Some(name) => stub.leave_group(&name).await,
                None => break,
            },
            "7" => {
                if start_vote_flow(&stub, &mut lines, &mut shutdown)
                    .await
                    .is_none()
                {
                    break;
                }
                Ok(())
            }
            "8" => {
                if cast_vote_flow(&stub, &mut lines, &mut shutdown)
                    .await
                    .is_none()
                {
                    break;
                }
                Ok(())
            }
            "9" => break,
            _ => {
                println!("Invalid choice");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("Error: {}", e);
        }
    }
    Ok(())
}

fn main() -> Result<(), QuorumcastError> {
    logger_init();

    let args = CliArgs::parse();
    let config = parsed_config!(args.config.as_deref() => ClientConfig;
                                mcast_group, mcast_port, reply_timeout_ms)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })?;

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let stub =
            ClientStub::new_and_setup(config, stop_rx.clone()).await?;
        menu(stub, stop_rx).await?;
        pf_info!("client stopped cleanly");
        Ok(())
    })
}
