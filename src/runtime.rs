// Fixed-rate control loop over zenoh
//
// Each cycle: drain command lines, deliver received CAN frames, tick every
// module in registration order, publish one status line per unmuted module.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Display;
use std::rc::Rc;
use std::time::Duration;

use serialport::SerialPort;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::can::{CanDispatcher, CanFrame, SharedCanBus, Slcan};
use crate::clock::SystemClock;
use crate::config::{
    ConfigError, InputConfig, ModuleConfig, RuntimeConfig, TOPIC_CMD, TOPIC_STATE, parse_can_id,
};
use crate::io::ModemLineInput;
use crate::messages::{self, Command, CommandError, Request};
use crate::module::Module;
use crate::motor::{AxisController, DriveController, RoboClaw};

// Modem lines are only polled, the baud rate is irrelevant
const INPUT_PORT_BAUDRATE: u32 = 9_600;

struct Entry {
    module: Box<dyn Module>,
    output: bool,
}

/// Owns the modules and routes commands and CAN frames to them
pub struct Router {
    entries: Vec<Entry>,
    dispatcher: CanDispatcher,
    drive_alias: String,
    can_bus: Option<SharedCanBus>,
}

impl Router {
    pub fn new(drive_alias: &str) -> Self {
        Self {
            entries: Vec::new(),
            dispatcher: CanDispatcher::new(),
            drive_alias: drive_alias.to_string(),
            can_bus: None,
        }
    }

    pub fn with_can_bus(mut self, bus: SharedCanBus) -> Self {
        self.can_bus = Some(bus);
        self
    }

    /// Add a module and subscribe it to the CAN ids it asks for
    pub fn register(&mut self, module: Box<dyn Module>) -> Result<(), ConfigError> {
        if self.position(module.name()).is_some() {
            return Err(ConfigError::DuplicateModule(module.name().to_string()));
        }
        let index = self.entries.len();
        for id in module.can_subscriptions() {
            self.dispatcher.subscribe(id, index);
        }
        info!("Registered module {}", module.name());
        self.entries.push(Entry {
            module,
            output: true,
        });
        Ok(())
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.module.name()).collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.module.name() == name)
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut Entry, CommandError> {
        self.entries
            .iter_mut()
            .find(|e| e.module.name() == name)
            .ok_or_else(|| CommandError::UnknownModule(name.to_string()))
    }

    pub fn setup_all(&mut self) {
        for entry in &mut self.entries {
            entry.module.setup();
        }
    }

    /// Parse and execute one command line
    pub fn handle_line(&mut self, line: &str) -> Result<(), CommandError> {
        let line = line.trim();
        let aliased;
        let line = if line == "pw" || line.starts_with("pw ") {
            aliased = format!("{} {}", self.drive_alias, line);
            aliased.as_str()
        } else {
            line
        };

        let parsed = messages::parse_line(line)?;
        match parsed.request {
            Request::Command(command) => self.command(&parsed.module, &command),
            Request::Set { key, value } => self.set_parameter(&parsed.module, &key, &value),
        }
    }

    /// Like `handle_line`, but errors are logged and dropped
    pub fn process_line(&mut self, line: &str) {
        if let Err(e) = self.handle_line(line) {
            warn!("Ignoring {:?}: {}", line.trim(), e);
        }
    }

    pub fn command(&mut self, module: &str, command: &Command) -> Result<(), CommandError> {
        debug!("{} <- {} {}", module, command.name, command.params);
        self.entry_mut(module)?.module.handle_command(command)
    }

    /// Module parameters first, then the keys every module shares
    pub fn set_parameter(&mut self, module: &str, key: &str, value: &str) -> Result<(), CommandError> {
        let entry = self.entry_mut(module)?;
        match entry.module.set_parameter(key, value) {
            Err(CommandError::UnknownKey(_)) if key == "output" => {
                entry.output = messages::parse_flag(value);
                Ok(())
            }
            result => result,
        }
    }

    pub fn dispatch_can(&mut self, frame: &CanFrame) {
        for &index in self.dispatcher.handlers(frame.raw_id()) {
            if let Some(entry) = self.entries.get_mut(index) {
                entry.module.handle_can_frame(frame);
            }
        }
    }

    /// Deliver every frame the bus has buffered
    pub fn poll_can(&mut self) {
        let Some(bus) = self.can_bus.clone() else {
            return;
        };
        loop {
            let received = bus.borrow_mut().receive();
            match received {
                Ok(Some(frame)) => self.dispatch_can(&frame),
                Ok(None) => break,
                Err(e) => {
                    warn!("CAN receive failed: {}", e);
                    break;
                }
            }
        }
    }

    pub fn tick_all(&mut self) {
        for entry in &mut self.entries {
            entry.module.tick();
        }
    }

    /// "<name> <status>" for every module with output enabled
    pub fn status_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.output)
            .map(|e| format!("{} {}", e.module.name(), e.module.status_text()))
            .collect()
    }

    pub fn stop_all(&mut self) {
        for entry in &mut self.entries {
            entry.module.stop();
        }
    }
}

/// Open every device named in the config and register its controller
pub fn build_router(config: &RuntimeConfig) -> Result<Router, ConfigError> {
    let mut router = Router::new(&config.drive_alias);

    let can_bus: Option<SharedCanBus> = match &config.can {
        Some(can) => {
            info!("Opening CAN adapter {} at {} bit/s", can.port, can.bitrate);
            let bus: SharedCanBus = Rc::new(RefCell::new(Slcan::open(&can.port, can.bitrate)?));
            router = router.with_can_bus(bus.clone());
            Some(bus)
        }
        None => None,
    };

    let mut input_ports = InputPorts::default();

    for module_config in &config.modules {
        let (module, params) = match module_config {
            ModuleConfig::Drive {
                name,
                port,
                address,
                baud,
                bumper,
                params,
            } => {
                info!("Opening RoboClaw {} on {} ({} baud)", address, port, baud);
                let link = RoboClaw::open(port, *address, *baud)?;
                let mut drive =
                    DriveController::new(name, Box::new(link), Box::new(SystemClock::new()));
                if let Some(input) = bumper {
                    drive = drive.with_bumper(Box::new(input_ports.open(input)?));
                }
                (Box::new(drive) as Box<dyn Module>, params)
            }
            ModuleConfig::Axis {
                name,
                can_id,
                home_switch,
                params,
            } => {
                let bus = can_bus
                    .clone()
                    .ok_or_else(|| ConfigError::MissingCan(name.clone()))?;
                let mut axis = AxisController::new(name, parse_can_id(can_id)?, bus);
                if let Some(input) = home_switch {
                    axis = axis.with_home_switch(Box::new(input_ports.open(input)?));
                }
                (Box::new(axis) as Box<dyn Module>, params)
            }
        };

        let name = module_config.name();
        router.register(module)?;
        for (key, value) in params {
            router
                .set_parameter(name, key, value)
                .map_err(|source| ConfigError::Parameter {
                    module: name.to_string(),
                    source,
                })?;
        }
    }

    router.setup_all();
    Ok(router)
}

/// Serial ports used for digital inputs; several lines may share one adapter
#[derive(Default)]
struct InputPorts {
    ports: HashMap<String, Box<dyn SerialPort>>,
}

impl InputPorts {
    fn open(&mut self, input: &InputConfig) -> Result<ModemLineInput, ConfigError> {
        let port = match self.ports.get(&input.port) {
            Some(port) => port.try_clone()?,
            None => {
                let port = serialport::new(&input.port, INPUT_PORT_BAUDRATE).open()?;
                let handle = port.try_clone()?;
                self.ports.insert(input.port.clone(), port);
                handle
            }
        };
        Ok(ModemLineInput::new(port, input.line, input.active_low))
    }
}

pub async fn run(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut router = build_router(&config)?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD).await?;
    let pub_state = session.declare_publisher(TOPIC_STATE).await?;

    let loop_hz = config.loop_hz.max(1);
    let mut tick = interval(Duration::from_millis((1000 / loop_hz).max(1)));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(
        "Runtime started: {}Hz loop, modules: {}",
        loop_hz,
        router.module_names().join(", ")
    );
    info!("Subscribed to: {}", TOPIC_CMD);
    info!("Publishing to: {}", TOPIC_STATE);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Stopping all modules");
                router.stop_all();
                break;
            }
        }

        // 1. Drain all pending command lines (non-blocking)
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            for line in String::from_utf8_lossy(&payload).lines() {
                if !line.trim().is_empty() {
                    router.process_line(line);
                }
            }
        }

        // 2. Feedback from the CAN bus
        router.poll_can();

        // 3. Control cycle
        router.tick_all();

        // 4. Publish status
        publish_status(router.status_lines(), |line| pub_state.put(line).into_future()).await;
    }

    Ok(())
}

/// Publish each status line; a failed put is logged and the cycle goes on.
/// Returns the number of lines that could not be published.
async fn publish_status<F, Fut, E>(lines: Vec<String>, mut put: F) -> usize
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut failed = 0;
    for line in lines {
        if let Err(e) = put(line).await {
            warn!("Failed to publish status on {}: {}", TOPIC_STATE, e);
            failed += 1;
        }
    }
    failed
}
