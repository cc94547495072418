use anyhow::{bail, Context, Result};
use env_logger::Env;
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use voice_failover::config::Config;
use voice_failover::manager::ServiceManager;
use voice_failover::provider::build_provider;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

const USAGE: &str = "使い方:
  voice-failover --generate-config [path]
  voice-failover transcribe <audio.wav> [--language xx] [--config path]
  voice-failover synthesize <text> <out.wav> [--language xx] [--voice id] [--config path]
  voice-failover status [--config path]
  voice-failover monitor [--config path]";

/// `--name value` 形式のオプション値を取得
fn option_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// オプションとその値を除いた位置引数
fn positional(args: &[String]) -> Vec<&str> {
    let mut result = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg.starts_with("--") {
            iter.next();
        } else {
            result.push(arg.as_str());
        }
    }
    result
}

/// 設定のログレベルでロガーを初期化し、設定を読み込む
fn init(args: &[String]) -> Result<Config> {
    let config_path = option_value(args, "--config").unwrap_or(DEFAULT_CONFIG_PATH);

    let config = if Path::new(config_path).exists() {
        Some(Config::from_file(config_path)?)
    } else {
        None
    };
    let log_level = config
        .as_ref()
        .map(|c| c.output.log_level.clone())
        .unwrap_or_else(|| "info".to_string());

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .filter_module("hyper", log::LevelFilter::Warn)
        .filter_module("reqwest", log::LevelFilter::Warn)
        .init();

    match config {
        Some(config) => Ok(config),
        None => Config::load_or_default(config_path),
    }
}

/// 設定に従ってプロバイダを登録したマネージャを作る
async fn build_manager(config: &Config) -> Result<ServiceManager> {
    let manager = ServiceManager::from_config(config);
    for provider_config in &config.providers {
        let provider = build_provider(provider_config)
            .await
            .with_context(|| format!("プロバイダ {} の初期化に失敗", provider_config.id))?;
        manager.register_provider(provider);
    }
    if config.providers.is_empty() {
        log::warn!("プロバイダが設定されていません");
    }
    Ok(manager)
}

async fn run_transcribe(args: &[String], config: &Config) -> Result<bool> {
    let positional = positional(args);
    let Some(audio_path) = positional.get(1) else {
        bail!("音声ファイルを指定してください\n{}", USAGE);
    };
    let language = option_value(args, "--language").unwrap_or(&config.stt.default_language);

    let audio = std::fs::read(audio_path)
        .with_context(|| format!("音声ファイルの読み込みに失敗: {}", audio_path))?;

    let manager = build_manager(config).await?;
    manager.start().await;
    let result = manager.transcribe(&audio, language).await;
    manager.stop().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

async fn run_synthesize(args: &[String], config: &Config) -> Result<bool> {
    let positional = positional(args);
    let (Some(text), Some(out_path)) = (positional.get(1), positional.get(2)) else {
        bail!("テキストと出力ファイルを指定してください\n{}", USAGE);
    };
    let language = option_value(args, "--language").unwrap_or(&config.tts.default_language);
    let voice = option_value(args, "--voice");

    let manager = build_manager(config).await?;
    manager.start().await;
    let result = manager.synthesize(text, language, voice).await;
    manager.stop().await;

    if result.success {
        std::fs::write(out_path, &result.audio)
            .with_context(|| format!("音声ファイルの書き込みに失敗: {}", out_path))?;
        log::info!("合成音声を保存しました: {}", out_path);
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

async fn run_status(config: &Config) -> Result<bool> {
    let manager = build_manager(config).await?;
    manager.start().await;
    let snapshot = manager.get_status();
    manager.stop().await;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(true)
}

async fn run_monitor(config: &Config) -> Result<bool> {
    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    let manager = build_manager(config).await?;
    manager.start().await;
    log::info!("ヘルスモニタを実行中 (Ctrl+C で停止)");

    let print_interval = match config.failover.health_check_interval_seconds {
        0 => Duration::from_secs(60),
        secs => Duration::from_secs(secs),
    };
    let mut ticker = tokio::time::interval(print_interval);

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = ticker.tick() => {
                // JSON Lines 形式で出力
                match serde_json::to_string(&manager.get_status()) {
                    Ok(json) => println!("{}", json),
                    Err(e) => log::error!("状態のシリアライズに失敗: {}", e),
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                // running を再確認
            }
        }
    }

    log::info!("停止処理を開始します...");
    manager.stop().await;
    log::info!("voice-failover を終了しました");
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().skip(1).collect();

    // 設定ファイル生成モード
    if args.first().map(String::as_str) == Some("--generate-config") {
        let config_path = args.get(1).map(String::as_str).unwrap_or(DEFAULT_CONFIG_PATH);
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    let Some(command) = args.first().cloned() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = init(&args)?;
    log::debug!("設定: {:?}", config);

    let success = match command.as_str() {
        "transcribe" => run_transcribe(&args, &config).await?,
        "synthesize" => run_synthesize(&args, &config).await?,
        "status" => run_status(&config).await?,
        "monitor" => run_monitor(&config).await?,
        other => {
            eprintln!("不明なコマンド: {}\n{}", other, USAGE);
            std::process::exit(2);
        }
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
