use anyhow::{Context, Result};
use clap::Parser;
use lightfetch::http::{DEFAULT_RETRIES, DEFAULT_RETRY_DELAY, HttpClient, Method, RequestOptions};
use serde_json::Value;
use std::io::Write;
use std::time::Duration;

/// lightfetch - fetch a URL with retries
///
/// Transient network failures are retried with a fixed delay. Gzip-encoded
/// responses are decompressed and the body is decoded using the charset of
/// the Content-Type header.
///
/// Examples:
///   lightfetch get https://example.com/
///   lightfetch post https://example.com/api --json -d '{"a": 1}'
#[derive(Parser, Debug)]
#[command(author, version = env!("LIGHTFETCH_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Extra request header, e.g. "Authorization: Bearer xyz" (repeatable)
    #[arg(
        short = 'H',
        long = "header",
        value_name = "NAME: VALUE",
        value_parser = parse_header,
        global = true
    )]
    headers: Vec<(String, String)>,

    /// Send and expect JSON; the response is pretty-printed
    #[arg(long, global = true)]
    json: bool,

    /// Retries after the first failed attempt
    #[arg(
        long,
        env = "LIGHTFETCH_RETRIES",
        value_name = "N",
        default_value_t = DEFAULT_RETRIES,
        global = true
    )]
    retries: usize,

    /// Seconds to wait between attempts
    #[arg(
        long = "retry-delay",
        env = "LIGHTFETCH_RETRY_DELAY",
        value_name = "SECS",
        default_value_t = DEFAULT_RETRY_DELAY.as_secs(),
        global = true
    )]
    retry_delay: u64,

    /// Per-attempt timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send a GET request
    Get(UrlArgs),

    /// Send a POST request
    Post(PostArgs),

    /// Send a DELETE request
    Delete(UrlArgs),
}

#[derive(clap::Args, Debug)]
struct UrlArgs {
    /// The URL to request
    url: String,
}

#[derive(clap::Args, Debug)]
struct PostArgs {
    /// The URL to request
    url: String,

    /// Request body, sent as is
    #[arg(short = 'd', long = "data", value_name = "TEXT")]
    data: Option<String>,
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing header name in '{}'", s));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

impl Cli {
    fn options(&self) -> RequestOptions {
        let mut options = RequestOptions::new()
            .retries(self.retries)
            .retry_delay(Duration::from_secs(self.retry_delay));
        for (name, value) in &self.headers {
            options = options.header(name.as_str(), value.as_str());
        }
        if let Some(secs) = self.timeout {
            options = options.timeout(Duration::from_secs(secs));
        }
        options
    }

    fn target(&self) -> (Method, &str, Option<Vec<u8>>) {
        match &self.command {
            Commands::Get(args) => (Method::Get, args.url.as_str(), None),
            Commands::Post(args) => (
                Method::Post,
                args.url.as_str(),
                args.data.as_ref().map(|d| d.clone().into_bytes()),
            ),
            Commands::Delete(args) => (Method::Delete, args.url.as_str(), None),
        }
    }
}

fn run(cli: &Cli) -> Result<String> {
    let client = HttpClient::new()?;
    let options = cli.options();
    let (method, url, data) = cli.target();

    if cli.json {
        let value: Value = client.request_json_text(method, url, data, &options)?;
        let mut pretty =
            serde_json::to_string_pretty(&value).context("Failed to format JSON response")?;
        pretty.push('\n');
        Ok(pretty)
    } else {
        client.request(method, url, data, &options)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let output = run(&cli)?;
    std::io::stdout()
        .lock()
        .write_all(output.as_bytes())
        .context("Failed to write response to stdout")?;
    Ok(())
}
