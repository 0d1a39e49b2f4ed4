use bodynodes_host::domain::listener::{BodynodeListener, LoggingListener};
use bodynodes_host::domain::models::{
    BODYPART_KATANA_TAG, BODYPART_UPPERARM_LEFT_TAG, PLAYER_DEFAULT_TAG,
    SENSORTYPE_ORIENTATION_ABS_TAG,
};
use bodynodes_host::domain::settings::{HostSettings, SettingsService};
use bodynodes_host::infrastructure::logging::init_logger;
use bodynodes_host::{Action, HostCommunicator};
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

const USAGE: &str = "usage: bodynodes-host <wifi|bluetooth|ble> [identifiers...]";
const PROMPT: &str = "Type a command [r/l/u to read message, h/p/b/s/w to send action, e to exit]: ";

fn communicator_for(transport: &str, settings: &HostSettings) -> anyhow::Result<HostCommunicator> {
    match transport {
        "wifi" => Ok(HostCommunicator::wifi(settings)),
        "bluetooth" => Ok(HostCommunicator::bluetooth(settings)),
        #[cfg(windows)]
        "ble" => Ok(HostCommunicator::ble(settings)),
        #[cfg(not(windows))]
        "ble" => anyhow::bail!("BLE is only available on Windows"),
        other => anyhow::bail!("unknown transport '{}'\n{}", other, USAGE),
    }
}

fn default_identifiers(transport: &str) -> Vec<String> {
    match transport {
        "wifi" => vec!["BN".to_string()],
        _ => Vec::new(),
    }
}

/// Action queued by a console command
fn action_for_command(command: &str) -> Option<Action> {
    let player = PLAYER_DEFAULT_TAG;
    let bodypart = BODYPART_KATANA_TAG;
    match command {
        "h" => Some(Action::haptic(player, bodypart, 250, 200)),
        "p" => Some(Action::set_player(player, bodypart, "luigi")),
        "b" => Some(Action::set_bodypart(player, bodypart, BODYPART_UPPERARM_LEFT_TAG)),
        "s" => Some(Action::enable_sensor(
            player,
            bodypart,
            SENSORTYPE_ORIENTATION_ABS_TAG,
            false,
        )),
        "w" => Some(Action::set_wifi(player, bodypart, "upperbody", "bodynodes1", None)),
        _ => None,
    }
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let transport = args.next().ok_or_else(|| anyhow::anyhow!(USAGE))?;
    let mut identifiers: Vec<String> = args.collect();
    if identifiers.is_empty() {
        identifiers = default_identifiers(&transport);
    }

    let settings_service = SettingsService::new()?;
    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();
    info!(
        "Starting Bodynodes host ({}), settings at {}",
        transport,
        settings_service.path().display()
    );

    let mut communicator = communicator_for(&transport, settings_service.get())?;
    communicator.start(&identifiers)?;

    let listener: Arc<dyn BodynodeListener> = Arc::new(LoggingListener);
    let weak: Weak<dyn BodynodeListener> = Arc::downgrade(&listener);

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{}", PROMPT);
        io::stdout().flush()?;

        let Some(line) = lines.next() else { break };
        let command = line?;
        let command = command.trim();

        match command {
            "e" => break,
            "r" => {
                let value = communicator.get_message_value(
                    PLAYER_DEFAULT_TAG,
                    BODYPART_KATANA_TAG,
                    SENSORTYPE_ORIENTATION_ABS_TAG,
                );
                match value {
                    Some(value) => println!("{}", value),
                    None => println!("None"),
                }
            }
            "l" => {
                if !communicator.add_listener(weak.clone()) {
                    warn!("Listener not added");
                }
            }
            "u" => {
                communicator.remove_listener(&weak);
            }
            other => match action_for_command(other) {
                Some(action) => communicator.add_action(action),
                None if other.is_empty() => {}
                None => println!("Unknown command: {}", other),
            },
        }

        communicator.send_all_actions();
    }

    communicator.stop();
    info!("Bodynodes host stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bodynodes_host::ActionKind;

    #[test]
    fn test_console_actions() {
        let haptic = action_for_command("h").unwrap();
        assert_eq!(haptic.player, "mario");
        assert_eq!(haptic.bodypart, "katana");
        assert_eq!(
            haptic.kind,
            ActionKind::Haptic {
                duration_ms: 250,
                strength: 200
            }
        );
        assert!(matches!(
            action_for_command("w").unwrap().kind,
            ActionKind::SetWifi { server_ip: None, .. }
        ));
        assert!(action_for_command("r").is_none());
    }

    #[test]
    fn test_transport_selection() {
        let settings = HostSettings::default();
        assert!(communicator_for("serial", &settings).is_err());
        assert_eq!(
            communicator_for("wifi", &settings).unwrap().transport_name(),
            "wifi"
        );
        assert_eq!(default_identifiers("wifi"), vec!["BN".to_string()]);
        assert!(default_identifiers("bluetooth").is_empty());
    }
}
