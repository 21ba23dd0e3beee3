//! 日志模块：env_logger 控制台彩色输出 + 同步写文件（带简单轮转）
use env_logger::fmt::Formatter;
use env_logger::{Builder, Target, WriteStyle};
use log::{Level, LevelFilter, Record};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

// ==================== 配置常量 ====================
const LOG_DIR: &str = "LOG_DIR";
const DEFAULT_LOG_DIR: &str = "logs";
const LOG_LEVEL: &str = "LOG_LEVEL";
const DEFAULT_LOG_LEVEL: &str = "INFO";
const LOG_FILE_NAME: &str = "transfer-reconciler.log";
const LOG_MAX_SIZE_MB: u64 = 10;
const LOG_MAX_ROTATIONS: usize = 5;

static INIT_LOGGER: Once = Once::new();
static FILE_WRITER: Mutex<Option<File>> = Mutex::new(None);

pub fn parse_level(raw: &str) -> Option<LevelFilter> {
    match raw.trim().to_uppercase().as_str() {
        "TRACE" => Some(LevelFilter::Trace),
        "DEBUG" => Some(LevelFilter::Debug),
        "INFO" => Some(LevelFilter::Info),
        "WARN" => Some(LevelFilter::Warn),
        "ERROR" => Some(LevelFilter::Error),
        "OFF" => Some(LevelFilter::Off),
        _ => None,
    }
}

// ==================== 初始化日志系统 ====================
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let log_dir = std::env::var(LOG_DIR).unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string());
        let raw_level = std::env::var(LOG_LEVEL).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
        let level_filter = parse_level(&raw_level).unwrap_or_else(|| {
            eprintln!("⚠️ 无效日志级别「{}」，使用默认 INFO", raw_level);
            LevelFilter::Info
        });

        let log_file_path = open_log_file(&log_dir);

        let mut builder = Builder::from_default_env();
        builder
            .filter(None, level_filter)
            .filter(Some("ethers_providers"), LevelFilter::Warn)
            .filter(Some("diesel"), LevelFilter::Warn)
            .filter(Some("bb8"), LevelFilter::Warn)
            .write_style(WriteStyle::Auto)
            .format(format_record)
            .target(Target::Stdout);

        if let Err(e) = builder.try_init() {
            eprintln!("❌ 日志初始化失败: {}", e);
            return;
        }
        log::info!(
            "✅ 日志系统初始化完成 | 级别: {} | 日志文件: {}",
            level_filter,
            log_file_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "无".to_string())
        );
    });
}

fn open_log_file(log_dir: &str) -> Option<PathBuf> {
    if let Err(e) = fs::create_dir_all(log_dir) {
        eprintln!("❌ 创建日志目录失败: {}", e);
        return None;
    }
    if let Err(e) = rotate_logs(log_dir, LOG_FILE_NAME) {
        eprintln!("⚠️ 日志轮转失败: {}", e);
    }

    let path = Path::new(log_dir).join(LOG_FILE_NAME);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path);
    match (file, FILE_WRITER.lock()) {
        (Ok(f), Ok(mut writer)) => {
            *writer = Some(f);
            Some(path)
        }
        (Err(e), _) => {
            eprintln!("❌ 创建日志文件失败: {}", e);
            None
        }
        (_, Err(_)) => None,
    }
}

fn format_record(f: &mut Formatter, record: &Record) -> io::Result<()> {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let module = record.module_path().unwrap_or("unknown");

    let level_color = match record.level() {
        Level::Error => "\x1b[91m",
        Level::Warn => "\x1b[93m",
        Level::Info => "\x1b[92m",
        Level::Debug => "\x1b[96m",
        Level::Trace => "\x1b[95m",
    };
    let reset = "\x1b[0m";

    // 文件写入失败不影响控制台
    if let Ok(mut guard) = FILE_WRITER.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(
                file,
                "[{}] [线程: {}] [{}] [{}] - {}",
                now,
                std::thread::current().name().unwrap_or("unknown"),
                module,
                record.level(),
                record.args()
            );
        }
    }

    writeln!(
        f,
        "[{}] [{}{:>5}{}] [{}] - {}",
        now,
        level_color,
        record.level(),
        reset,
        module,
        record.args()
    )
}

// ==================== 日志轮转 ====================
fn rotate_logs(log_dir: &str, log_file: &str) -> io::Result<()> {
    let log_path = Path::new(log_dir).join(log_file);
    if !log_path.exists() {
        return Ok(());
    }

    let file_size_mb = fs::metadata(&log_path)?.len() / (1024 * 1024);
    if file_size_mb < LOG_MAX_SIZE_MB {
        return Ok(());
    }

    for i in (1..LOG_MAX_ROTATIONS).rev() {
        let src = Path::new(log_dir).join(format!("{}.{}", log_file, i));
        let dest = Path::new(log_dir).join(format!("{}.{}", log_file, i + 1));
        if src.exists() {
            fs::rename(&src, &dest)?;
        }
    }
    fs::rename(&log_path, Path::new(log_dir).join(format!("{}.1", log_file)))?;
    Ok(())
}

// ==================== 便捷日志宏 ====================
#[macro_export]
macro_rules! log_trace { ($($arg:tt)*) => { log::trace!($($arg)*) }; }
#[macro_export]
macro_rules! log_debug { ($($arg:tt)*) => { log::debug!($($arg)*) }; }
#[macro_export]
macro_rules! log_info  { ($($arg:tt)*) => { log::info!($($arg)*) }; }
#[macro_export]
macro_rules! log_warn  { ($($arg:tt)*) => { log::warn!($($arg)*) }; }
#[macro_export]
macro_rules! log_error { ($($arg:tt)*) => { log::error!($($arg)*) }; }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_case_insensitive() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" Warn "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn rotation_shifts_oversized_log() {
        let dir = std::env::temp_dir().join(format!("reconciler-log-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let dir_str = dir.to_str().unwrap();
        let path = dir.join(LOG_FILE_NAME);
        let file = File::create(&path).unwrap();
        file.set_len((LOG_MAX_SIZE_MB + 1) * 1024 * 1024).unwrap();

        rotate_logs(dir_str, LOG_FILE_NAME).unwrap();
        assert!(!path.exists());
        assert!(dir.join(format!("{}.1", LOG_FILE_NAME)).exists());

        fs::remove_dir_all(&dir).unwrap();
    }
}
