use std::io::{self, Write};
use std::process;
use std::time::Duration;

use gearwire::config::{AppConfig, SubmitConfig};
use gearwire::engine::{run_session, Connection, SessionEnd};
use gearwire::error::GearmanError;
use gearwire::logging::{LogLevel, Logger, LoggerConfig};
use gearwire::protocol::PacketCodec;
use gearwire::shutdown::ShutdownHooks;
use gearwire::task::{Priority, Task, TaskHandle, TaskState, UniqueKey};
use gearwire::transport::TcpTransport;
use serde_json::json;

const LOG_CONTEXT: &str = "gearwire::main";

fn main() {
    let app_config = load_config_or_exit();
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    });
    logger.log(
        LogLevel::Info,
        Some(LOG_CONTEXT),
        &format!(
            "{} v{} (build {}) starting",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("GEARWIRE_BUILD_DATE_UTC")
        ),
        Some(json!({
            "host": app_config.server.host,
            "port": app_config.server.port,
        })),
    );

    let task = build_task(&app_config.submit, &logger).unwrap_or_else(|message| {
        eprintln!("submit configuration error: {message}");
        process::exit(2);
    });

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });

    match run(&app_config, &logger, &task, &shutdown_hooks) {
        Ok(TaskState::Completed) | Ok(TaskState::BackgroundFired) => {}
        Ok(state) => {
            logger.warn(
                Some(LOG_CONTEXT),
                &format!("task {} ended in state {state:?}", task.id()),
            );
            process::exit(1);
        }
        Err(error) => {
            logger.error(Some(LOG_CONTEXT), &error.to_string());
            process::exit(1);
        }
    }
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn build_task(submit: &SubmitConfig, logger: &Logger) -> Result<TaskHandle, String> {
    if submit.function.is_empty() {
        return Err("submit.function must be set".to_owned());
    }
    let priority = Priority::from_config_value(&submit.priority).ok_or_else(|| {
        format!(
            "invalid submit.priority '{}'. Allowed values: normal, high, low",
            submit.priority
        )
    })?;

    let mut task = Task::new(submit.function.as_str(), submit.payload.as_bytes())
        .with_priority(priority)
        .with_background(submit.background)
        .with_retries(submit.retries)
        .with_timeout(Duration::from_millis(submit.timeout_ms));
    if let Some(unique) = UniqueKey::from_config_value(&submit.unique) {
        task = task.with_unique(unique);
    }

    let retry_logger = logger.clone();
    let fail_logger = logger.clone();
    let status_logger = logger.clone();
    let warning_logger = logger.clone();
    let exception_logger = logger.clone();
    let lost_logger = logger.clone();

    let task = task
        .on_complete(|payload| {
            let mut stdout = io::stdout().lock();
            let _ = stdout.write_all(payload);
            let _ = writeln!(stdout);
        })
        .on_data(|chunk| {
            let mut stdout = io::stdout().lock();
            let _ = stdout.write_all(chunk);
            let _ = stdout.flush();
        })
        .on_retry(move |attempt| {
            retry_logger.info(Some(LOG_CONTEXT), &format!("job failed, retry attempt {attempt}"));
        })
        .on_fail(move || {
            fail_logger.warn(Some(LOG_CONTEXT), "job failed");
        })
        .on_status(move |numerator, denominator| {
            status_logger.log(
                LogLevel::Info,
                Some(LOG_CONTEXT),
                "job status",
                Some(json!({
                    "numerator": String::from_utf8_lossy(numerator),
                    "denominator": String::from_utf8_lossy(denominator),
                })),
            );
        })
        .on_warning(move |message| {
            warning_logger.warn(
                Some(LOG_CONTEXT),
                &format!("worker warning: {}", String::from_utf8_lossy(message)),
            );
        })
        .on_exception(move |message| {
            exception_logger.warn(
                Some(LOG_CONTEXT),
                &format!("worker exception: {}", String::from_utf8_lossy(message)),
            );
        })
        .on_connection_lost(move || {
            lost_logger.error(
                Some(LOG_CONTEXT),
                "connection to job server lost before the job finished",
            );
        });

    Ok(TaskHandle::new(task))
}

fn run(
    app_config: &AppConfig,
    logger: &Logger,
    task: &TaskHandle,
    shutdown_hooks: &ShutdownHooks,
) -> Result<TaskState, GearmanError> {
    let transport = TcpTransport::connect(&app_config.server)?;
    logger.info(
        Some(LOG_CONTEXT),
        &format!("connected to job server at {}", transport.peer_addr()),
    );

    let codec = PacketCodec::from_wire_config(&app_config.wire);
    let mut connection = Connection::new(transport, codec, logger.clone());
    if let Err(error) = connection.queue(task).and_then(|()| connection.on_open()) {
        let _ = connection.transport().shutdown();
        connection.on_close();
        return Err(error.into());
    }
    logger.log(
        LogLevel::Info,
        Some(LOG_CONTEXT),
        "task submitted",
        Some(json!({
            "task_id": task.id().to_string(),
            "function": app_config.submit.function,
            "background": app_config.submit.background,
        })),
    );

    let report = run_session(&mut connection, &app_config.wire, || {
        task.state().is_terminal() || shutdown_hooks.is_triggered()
    })?;
    match report.end {
        SessionEnd::PeerClosed => {
            logger.warn(Some(LOG_CONTEXT), "job server closed the connection");
        }
        SessionEnd::Stopped if shutdown_hooks.is_triggered() => {
            logger.info(Some(LOG_CONTEXT), "shutdown signal received, task abandoned");
        }
        SessionEnd::Stopped => {}
    }
    logger.log(
        LogLevel::Debug,
        Some(LOG_CONTEXT),
        "session finished",
        Some(json!({
            "finished_tasks": report.finished.len(),
            "abandoned_tasks": report.abandoned.len(),
        })),
    );
    Ok(task.state())
}
