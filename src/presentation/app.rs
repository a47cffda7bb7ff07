//! Application event loop
//!
//! Owns the controllers and multiplexes link events, the timeout tick,
//! console input and the outgoing [`AppEvent`] stream on one task.

use crate::domain::controller::{ControllerError, DeviceController};
use crate::domain::models::{
    AppEvent, ConnectionStatus, LinkRole, MessageSeverity, StatusMessage,
};
use crate::domain::parameters::TUNER_ON;
use crate::domain::pedal::PedalController;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::transport::Transport;
use crate::infrastructure::bluetooth::{BluetoothService, LinkEvent, LinkHandle};
use crate::infrastructure::midi::framer::MidiFramer;
use crate::infrastructure::midi::sysex::{Address, SysExCodec};
use crate::presentation::console::{self, ConsoleCommand};
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Run one console command against the amp controller
pub fn execute<T: Transport>(
    controller: &mut DeviceController<T>,
    command: &ConsoleCommand,
    now: Instant,
) -> Result<Flow, ControllerError> {
    match command {
        ConsoleCommand::Read(key) => {
            let address = resolve(controller, key)?;
            controller.read_parameter(address, now)?;
        }
        ConsoleCommand::Write { key, value } => {
            let address = resolve(controller, key)?;
            controller.write_parameter(address, *value, now)?;
        }
        ConsoleCommand::ReadAll => controller.read_all(now)?,
        ConsoleCommand::Block { address, size } => controller.read_block(*address, *size, now)?,
        ConsoleCommand::Tuner(on) => {
            let def = controller
                .catalogue()
                .by_name(TUNER_ON)
                .ok_or_else(|| ControllerError::UnknownParameter(TUNER_ON.to_string()))?;
            let value = if *on { def.max } else { def.min };
            controller.write_named(TUNER_ON, value, now)?;
        }
        ConsoleCommand::Status => print_status(controller),
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

fn resolve<T: Transport>(
    controller: &DeviceController<T>,
    key: &str,
) -> Result<Address, ControllerError> {
    controller
        .catalogue()
        .resolve(key)
        .ok_or_else(|| ControllerError::UnknownParameter(key.to_string()))
}

fn print_status<T: Transport>(controller: &DeviceController<T>) {
    println!(
        "amp: {:?}, {} in flight, {} reads queued",
        controller.status(),
        controller.in_flight(),
        controller.queued_reads()
    );
    if let Some(reading) = controller.tuner_reading() {
        println!("  tuner: {:?}", reading);
    }
    for (address, state) in controller.states() {
        let name = controller
            .catalogue()
            .by_address(address)
            .map(|d| d.name.as_str())
            .unwrap_or("?");
        println!("  {:<14} [{}] {}", name, address, state);
    }
}

/// What woke the event loop
enum Input {
    Amp(Option<LinkEvent>),
    Pedal(Option<LinkEvent>),
    Tick,
    Line(std::io::Result<Option<String>>),
    Event(AppEvent),
    Interrupt,
}

struct PedalLink {
    controller: PedalController<LinkHandle>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
}

pub struct RemoteApp {
    controller: DeviceController<LinkHandle>,
    amp_events: mpsc::UnboundedReceiver<LinkEvent>,
    pedal: Option<PedalLink>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    event_receiver: mpsc::UnboundedReceiver<AppEvent>,
}

impl RemoteApp {
    /// Connect the amp (required) and the pedal (optional)
    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let mut bluetooth = BluetoothService::new().await?;

        let _ = event_sender.send(AppEvent::ConnectionStatus {
            link: LinkRole::Amp,
            status: ConnectionStatus::Connecting,
        });
        let (amp, amp_events) = bluetooth
            .connect(LinkRole::Amp, &settings.amp)
            .await
            .context("Failed to connect to the amp")?;

        // No await between spawning the link task and this point, so the
        // controller still sees Connecting and loads on the first Connected
        let controller = DeviceController::new(
            amp,
            SysExCodec::new(settings.sysex.clone()),
            settings.catalogue(),
            settings.controller.clone(),
            settings.tuner.clone(),
            event_sender.clone(),
        );

        let pedal = if settings.pedal.enabled {
            let _ = event_sender.send(AppEvent::ConnectionStatus {
                link: LinkRole::Pedal,
                status: ConnectionStatus::Connecting,
            });
            match bluetooth.connect(LinkRole::Pedal, &settings.pedal).await {
                Ok((handle, events)) => Some(PedalLink {
                    controller: PedalController::new(
                        handle,
                        MidiFramer::new(settings.controller.max_sysex_len),
                        settings.pedal_bindings.clone(),
                        event_sender.clone(),
                    ),
                    events,
                }),
                Err(e) => {
                    let _ = event_sender.send(AppEvent::LogMessage(StatusMessage {
                        message: format!("Pedal unavailable: {}", e),
                        severity: MessageSeverity::Warning,
                    }));
                    let _ = event_sender.send(AppEvent::ConnectionStatus {
                        link: LinkRole::Pedal,
                        status: ConnectionStatus::Disconnected,
                    });
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            controller,
            amp_events,
            pedal,
            event_sender,
            event_receiver,
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.controller.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        println!("{}", console::HELP);

        loop {
            let input = tokio::select! {
                event = self.amp_events.recv() => Input::Amp(event),
                event = next_pedal_event(&mut self.pedal) => Input::Pedal(event),
                _ = tick.tick() => Input::Tick,
                line = lines.next_line(), if stdin_open => Input::Line(line),
                Some(event) = self.event_receiver.recv() => Input::Event(event),
                _ = &mut ctrl_c => Input::Interrupt,
            };
            let now = Instant::now();

            match input {
                Input::Amp(Some(event)) => self.on_amp_event(event, now),
                Input::Amp(None) => {
                    warn!("Amp link closed");
                    break;
                }
                Input::Pedal(Some(event)) => self.on_pedal_event(event, now),
                Input::Pedal(None) => {
                    info!("Pedal link closed");
                    self.pedal = None;
                }
                Input::Tick => {
                    self.controller.poll_timeouts(now);
                }
                Input::Line(Ok(Some(line))) => {
                    if self.on_line(&line, now) == Flow::Quit {
                        break;
                    }
                }
                Input::Line(Ok(None)) => {
                    // Keep serving the pedal without a console
                    info!("Console input closed");
                    stdin_open = false;
                }
                Input::Line(Err(e)) => {
                    error!("Console read failed: {}", e);
                    stdin_open = false;
                }
                Input::Event(event) => console::log_event(&event),
                Input::Interrupt => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn on_amp_event(&mut self, event: LinkEvent, now: Instant) {
        let link = self.controller.transport().role();
        match event {
            LinkEvent::State(status) => {
                self.controller.set_connection_status(status, now);
                self.emit(AppEvent::ConnectionStatus {
                    link,
                    status,
                });
            }
            LinkEvent::Packet(packet) => self.controller.handle_packet(&packet, now),
            LinkEvent::WriteFailed(e) => self.emit(AppEvent::WriteFailed {
                link,
                reason: e.to_string(),
            }),
            LinkEvent::Lost { attempts } => self.emit(AppEvent::ConnectionLost {
                link,
                attempts,
            }),
        }
    }

    fn on_pedal_event(&mut self, event: LinkEvent, now: Instant) {
        let Some(pedal) = self.pedal.as_mut() else {
            return;
        };
        let link = pedal.controller.transport().role();
        match event {
            LinkEvent::State(status) => {
                pedal.controller.set_connection_status(status);
                self.emit(AppEvent::ConnectionStatus {
                    link,
                    status,
                });
            }
            LinkEvent::Packet(packet) => {
                for dispatch in pedal.controller.handle_packet(&packet) {
                    if let Err(e) =
                        self.controller
                            .apply_action(&dispatch.action, dispatch.event.value, now)
                    {
                        self.report(format!("Pedal action {:?} failed: {}", dispatch.action, e));
                    }
                }
            }
            LinkEvent::WriteFailed(e) => self.emit(AppEvent::WriteFailed {
                link,
                reason: e.to_string(),
            }),
            LinkEvent::Lost { attempts } => self.emit(AppEvent::ConnectionLost {
                link,
                attempts,
            }),
        }
    }

    fn on_line(&mut self, line: &str, now: Instant) -> Flow {
        let command = match ConsoleCommand::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Flow::Continue,
            Err(e) => {
                self.report(e.to_string());
                return Flow::Continue;
            }
        };
        match execute(&mut self.controller, &command, now) {
            Ok(flow) => {
                if command == ConsoleCommand::Status {
                    match &self.pedal {
                        Some(pedal) => println!("pedal: {:?}", pedal.controller.status()),
                        None => println!("pedal: not connected"),
                    }
                }
                flow
            }
            Err(e) => {
                self.report(format!("{:?} failed: {}", command, e));
                Flow::Continue
            }
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }

    fn report(&self, message: String) {
        self.emit(AppEvent::LogMessage(StatusMessage {
            message,
            severity: MessageSeverity::Error,
        }));
    }

    /// Close both links and flush whatever events are still queued
    async fn shutdown(mut self) {
        self.controller.transport().disconnect();
        if let Some(pedal) = &self.pedal {
            pedal.controller.transport().disconnect();
        }

        let amp_events = &mut self.amp_events;
        let closed = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(event) = amp_events.recv().await {
                if event == LinkEvent::State(ConnectionStatus::Disconnected) {
                    break;
                }
            }
        })
        .await;
        if closed.is_err() {
            warn!("Amp link did not close within {:?}", SHUTDOWN_GRACE);
        }

        while let Ok(event) = self.event_receiver.try_recv() {
            console::log_event(&event);
        }
        info!("Bye");
    }
}

async fn next_pedal_event(pedal: &mut Option<PedalLink>) -> Option<LinkEvent> {
    match pedal {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}
