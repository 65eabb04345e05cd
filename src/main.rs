use clap::{Parser, Subcommand};
use roomcall_lib::peer::ice::check_ice_server_availability;
use roomcall_lib::utils::random_id;
use roomcall_lib::{logger, Backends, ClientConfig, MediaConstraints, RoomAdmin, SessionHandle};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::warn;

#[derive(Parser)]
#[command(name = "roomcall", version, about = "Room-based WebRTC calls")]
struct Cli {
    /// JSON config file
    #[arg(long, env = "ROOMCALL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    signaling_url: Option<String>,

    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Join a room and stay in the call until Ctrl-C
    Join {
        /// Room id; a new one is generated when omitted
        #[arg(default_value = "")]
        room: String,
        /// Local participant id
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        audio_only: bool,
    },
    /// List active rooms
    Rooms,
    /// Reset one room, or every room when none is given
    Reset { room: Option<String> },
    /// Check that the rendezvous service is up
    Probe,
    /// Check every configured STUN/TURN server
    CheckIce,
}

#[tokio::main]
async fn main() -> ExitCode {
    logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> roomcall_lib::Result<()> {
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }
    config.validate()?;

    match cli.command {
        Cmd::Join {
            room,
            user,
            audio_only,
        } => {
            if audio_only {
                config.media = MediaConstraints::audio_only();
            }
            join(config, &room, user.unwrap_or_else(random_id)).await
        }
        Cmd::Rooms => {
            let admin = RoomAdmin::new(&config.api_url, config.probe_timeout())?;
            let list = admin.list_rooms().await?;
            println!("{} rooms, {} users connected", list.total_rooms, list.connected_users);
            for room in list.rooms {
                println!(
                    "  {}  {}/2  [{}]  since {}",
                    room.room_id,
                    room.user_count,
                    room.users.join(", "),
                    room.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Cmd::Reset { room } => {
            let admin = RoomAdmin::new(&config.api_url, config.probe_timeout())?;
            let outcome = match room {
                Some(room) => admin.reset_room(&room).await?,
                None => admin.reset_all_rooms().await?,
            };
            println!("{}", outcome.message);
            Ok(())
        }
        Cmd::Probe => {
            let admin = RoomAdmin::new(&config.api_url, config.probe_timeout())?;
            let status = admin.probe().await?;
            println!(
                "{}: {} users, {} rooms",
                status.status, status.connected_users, status.active_rooms
            );
            Ok(())
        }
        Cmd::CheckIce => {
            for server in &config.ice_servers {
                let available = match check_ice_server_availability(server, config.probe_timeout()).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!("ICE server {} check failed: {e}", server.id);
                        false
                    }
                };
                let verdict = if available { "available" } else { "unavailable" };
                println!("{} ({}): {verdict}", server.id, server.url);
            }
            Ok(())
        }
    }
}

async fn join(config: ClientConfig, room: &str, user: String) -> roomcall_lib::Result<()> {
    let backends = Backends::production(&config)?;
    let session = SessionHandle::spawn(user, config, backends);
    let mut updates = session.subscribe();
    session.join(room)?;

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let status = updates.borrow_and_update().clone();
                println!(
                    "[{}] {} {}",
                    status.room_id.as_deref().unwrap_or("-"),
                    status.phase,
                    status.status_message
                );
                if status.phase.is_terminal() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                session.leave()?;
            }
        }
    }
}
