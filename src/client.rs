use color_eyre::eyre::{
    Result,
    WrapErr,
};
use fhe_spin::{
    clock::SystemClock,
    config::SessionConfig,
    error::GameError,
    play::{
        PlayEvent,
        PlayState,
    },
    sandbox::{
        SandboxChain,
        SandboxRelayer,
        SandboxSigner,
    },
    session::{
        GameSession,
        SessionParts,
    },
    store::PersistentKeyStore,
    types::{
        Address,
        UserGameState,
        format_eth,
        parse_eth,
    },
    wheel::TimedAnimator,
};
use rand::{
    Rng,
    SeedableRng,
    rngs::StdRng,
};
use std::{
    path::PathBuf,
    sync::Arc,
};
use tokio::{
    io::{
        AsyncBufReadExt,
        BufReader,
    },
    sync::broadcast::error::RecvError,
};
use tracing::info;

pub struct AppConfig {
    pub state_dir: PathBuf,
    pub session: SessionConfig,
    pub seed: u64,
    pub pool_wei: u128,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Command {
    Help,
    Authorize,
    State,
    Refresh,
    CheckIn,
    BuyGm(u128),
    BuySpins(u64),
    Spin,
    Resume,
    Claim(Option<u128>),
    LastError,
    Publish,
    Unpublish,
    Leaderboard,
    ResetKeys,
    Quit,
}

const HELP: &str = "\
Commands:
  help                 show this message
  authorize            sign the decryption authorization
  state                show the last reconciled balances
  refresh              reload balances from the ledger
  checkin              claim the daily GM reward
  buy-gm <eth>         buy GM tokens with ETH
  buy-spins <n>        convert GM into spins
  spin                 play one spin
  resume               settle a spin left unsettled by a previous run
  claim [eth]          claim pending ETH (all when no amount is given)
  last-error           show the contract's last error for this account
  publish / unpublish  manage your leaderboard entry
  leaderboard          show published scores
  reset-keys           generate a new decryption keypair
  quit                 exit";

fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        return Err("empty command".into());
    };
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments for '{head}'"));
    }
    let eth = |raw: Option<&str>| -> std::result::Result<u128, String> {
        let raw = raw.ok_or_else(|| format!("'{head}' requires an ETH amount"))?;
        parse_eth(raw).ok_or_else(|| format!("invalid ETH amount '{raw}'"))
    };
    let command = match head {
        "help" | "?" => Command::Help,
        "authorize" | "auth" => Command::Authorize,
        "state" => Command::State,
        "refresh" => Command::Refresh,
        "checkin" => Command::CheckIn,
        "buy-gm" => Command::BuyGm(eth(arg)?),
        "buy-spins" => {
            let raw = arg.ok_or("'buy-spins' requires a count")?;
            Command::BuySpins(
                raw.parse()
                    .map_err(|_| format!("invalid spin count '{raw}'"))?,
            )
        }
        "spin" => Command::Spin,
        "resume" => Command::Resume,
        "claim" => Command::Claim(match arg {
            Some(_) => Some(eth(arg)?),
            None => None,
        }),
        "last-error" => Command::LastError,
        "publish" => Command::Publish,
        "unpublish" => Command::Unpublish,
        "leaderboard" | "lb" => Command::Leaderboard,
        "reset-keys" => Command::ResetKeys,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}', try 'help'")),
    };
    if arg.is_some()
        && !matches!(
            command,
            Command::BuyGm(_) | Command::BuySpins(_) | Command::Claim(_)
        )
    {
        return Err(format!("'{head}' takes no arguments"));
    }
    Ok(command)
}

fn player_address(seed: u64) -> Address {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    Address::new(rng.random())
}

fn render_state(snapshot: Option<&UserGameState>) -> String {
    match snapshot {
        Some(state) => format!(
            "spins: {}  GM: {}  pending: {} ETH  score: {}  last slot: {}  (v{})",
            state.spins,
            state.gm,
            format_eth(u128::from(state.pending_eth_wei)),
            state.score,
            state
                .last_slot
                .map_or_else(|| "-".to_string(), |slot| slot.to_string()),
            state.version,
        ),
        None => "balances unavailable (run 'authorize' to decrypt)".to_string(),
    }
}

fn render_event(event: &PlayEvent) -> Option<String> {
    match event {
        PlayEvent::StateChanged(PlayState::Idle) => None,
        PlayEvent::StateChanged(PlayState::Committing) => Some("submitting spin...".into()),
        PlayEvent::StateChanged(PlayState::AnimatingOutcome) => Some("the wheel is spinning...".into()),
        PlayEvent::StateChanged(PlayState::Settling) => Some("settling prize...".into()),
        PlayEvent::StateChanged(PlayState::Reconciling) => Some("refreshing balances...".into()),
        PlayEvent::StateChanged(PlayState::Error(_)) => None,
        PlayEvent::AnimationFinished { .. } => None,
        PlayEvent::OutcomeRevealed { text, .. } => Some(format!(">>> {text}")),
        PlayEvent::Notice(message) => Some(format!("!! {message}")),
    }
}

fn report(err: &GameError) {
    println!("error: {}", err.user_message());
}

pub async fn run_app(config: AppConfig) -> Result<()> {
    let AppConfig {
        state_dir,
        session: session_config,
        seed,
        pool_wei,
    } = config;
    std::fs::create_dir_all(&state_dir)
        .wrap_err_with(|| format!("creating state dir {}", state_dir.display()))?;
    let store = PersistentKeyStore::open_sled(state_dir.join("keystore"))
        .wrap_err("opening key store")?;

    let chain = SandboxChain::new(seed);
    chain.set_pool_balance(pool_wei);
    let relayer = SandboxRelayer::new(chain.clone());
    let signer = SandboxSigner::new(player_address(seed));
    let animator = Arc::new(TimedAnimator::new(session_config.play.animation()));
    let session = Arc::new(GameSession::new(SessionParts {
        ledger: Arc::new(chain),
        relayer: Arc::new(relayer),
        signer: Arc::new(signer),
        store,
        animator,
        clock: Arc::new(SystemClock),
        config: session_config,
    }));

    let mut events = session.subscribe_play_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = render_event(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("fhe-spin sandbox");
    println!("account:  {}", session.account());
    println!("contract: {}", session.contract());
    let initial = session.start().await;
    println!("{}", render_state(initial.as_ref()));
    if !session.has_cached_authorization() {
        println!("run 'authorize' to decrypt your balances");
    }
    if let Ok(Some(pending)) = session.pending_settlement() {
        println!("unsettled spin found (slot {}); run 'resume'", pending.slot);
    }
    println!("type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.wrap_err("reading stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        info!(?command, "command received");
        if command == Command::Quit {
            break;
        }
        execute(&session, command).await;
    }

    session.shutdown();
    printer.abort();
    Ok(())
}

async fn execute(session: &GameSession, command: Command) {
    match command {
        Command::Help => println!("{HELP}"),
        Command::Authorize => match session.authorize().await {
            Ok(artifact) => println!(
                "authorized until unix {} ({}-day window)",
                artifact.expires_at, artifact.window_length_days
            ),
            Err(err) => report(&err),
        },
        Command::State => println!("{}", render_state(session.snapshot().as_ref())),
        Command::Refresh => println!("{}", render_state(session.refresh().await.as_ref())),
        Command::CheckIn => match session.daily_check_in().await {
            Ok(_) => println!("checked in"),
            Err(err) => report(&err),
        },
        Command::BuyGm(wei) => match session.buy_gm_tokens(wei).await {
            Ok(_) => println!("bought GM with {} ETH", format_eth(wei)),
            Err(err) => report(&err),
        },
        Command::BuySpins(count) => match session.buy_spins_with_gm(count).await {
            Ok(_) => println!("bought {count} spin(s)"),
            Err(err) => report(&err),
        },
        Command::Spin => match session.play().await {
            Ok(outcome) => println!("{}", render_state(outcome.snapshot.as_ref())),
            Err(err) => report(&err),
        },
        Command::Resume => match session.resume_settlement().await {
            Ok(outcome) => println!("settled: {}", outcome.text),
            Err(err) => report(&err),
        },
        Command::Claim(amount) => match session.claim_eth(amount).await {
            Ok(_) => println!("claim requested"),
            Err(err) => report(&err),
        },
        Command::LastError => match session.last_error().await {
            Ok(Some(last)) => match last.at {
                Some(at) => println!("{} (code {}) at {}", last.message, last.code, at.to_rfc3339()),
                None => println!("{} (code {})", last.message, last.code),
            },
            Ok(None) => println!("no error recorded"),
            Err(err) => report(&err),
        },
        Command::Publish => match session.publish_score().await {
            Ok(score) => println!("published score {score}"),
            Err(err) => report(&err),
        },
        Command::Unpublish => match session.unpublish_score().await {
            Ok(_) => println!("score unpublished"),
            Err(err) => report(&err),
        },
        Command::Leaderboard => match session.refresh_leaderboard().await {
            Ok(entries) if entries.is_empty() => println!("no published scores yet"),
            Ok(entries) => {
                for (rank, entry) in entries.iter().enumerate() {
                    let marker = if entry.address == session.account() { " (you)" } else { "" };
                    println!("{:>2}. {} {}{marker}", rank + 1, entry.address, entry.score);
                }
            }
            Err(err) => report(&err),
        },
        Command::ResetKeys => match session.reset_keypair() {
            Ok(public_key) => println!("new public key {}…; run 'authorize' again", &public_key[..public_key.len().min(16)]),
            Err(err) => report(&err),
        },
        Command::Quit => {}
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use fhe_spin::types::WEI_PER_ETH;

    #[test]
    fn parse_command__reads_arguments() {
        assert_eq!(parse_command("buy-spins 3"), Ok(Command::BuySpins(3)));
        assert_eq!(parse_command("buy-gm 0.5"), Ok(Command::BuyGm(WEI_PER_ETH / 2)));
        assert_eq!(parse_command("claim"), Ok(Command::Claim(None)));
        assert_eq!(
            parse_command("claim 0.01"),
            Ok(Command::Claim(Some(WEI_PER_ETH / 100)))
        );
    }

    #[test]
    fn parse_command__rejects_bad_input() {
        assert!(parse_command("buy-spins").is_err());
        assert!(parse_command("buy-spins many").is_err());
        assert!(parse_command("spin now").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn render_state__explains_missing_snapshot() {
        assert!(render_state(None).contains("authorize"));
    }
}
