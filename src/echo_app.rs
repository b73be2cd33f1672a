use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{App, Arg, ArgMatches};

use crate::echo_config::{
    read_config_file, ConfigFile, EchoConfiguration, HttpConfiguration, TlsConfiguration,
};
use crate::DEFAULT_HOST;

const ABOUT: &str = r#"
Run a request echo server

This starts an HTTP server that answers every request with an HTML page
listing the request's CGI-style server variables, query parameters, and
form parameters, with all values escaped for safe HTML embedding. It is a
diagnostic tool: point a client (or a proxy under test) at it and read back
exactly what arrived.

Defaults can be placed in a TOML config file; command line flags override
anything set there.
"#;

const ENV_VAR_HELP: &str = "specifies an extra variable to list in the Server Variables section of every response. Multiple variables can be set per flag (e.g. -e FOO=bar BAR=baz) or the flag can be used multiple times (e.g. `-e FOO=bar -e BAR=baz`). Values can be quoted (e.g. FOO=\"my bar\")";

// Program configuration
const ARG_CONFIG_FILE: &str = "config";

// HTTP configuration
const ARG_LISTEN_ON: &str = "listen";
const ARG_DEFAULT_HOSTNAME: &str = "hostname";
const ARG_TLS_CERT_FILE: &str = "tls_cert_file";
const ARG_TLS_KEY_FILE: &str = "tls_key_file";

// Extra server variables
const ARG_ENV_VARS: &str = "env_vars";
const ARG_ENV_FILES: &str = "env_files";

const DEFAULT_LISTEN_ON: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
    3000,
);

pub fn echo_app_definition() -> App<'static, 'static> {
    App::new("Request Echo Server")
        .version(clap::crate_version!())
        .about(ABOUT)
        .arg(
            Arg::with_name(ARG_CONFIG_FILE)
                .short("c")
                .long("config")
                .value_name("CONFIG_TOML")
                .help("the path to an optional TOML configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(ARG_LISTEN_ON)
                .short("l")
                .long("listen")
                .value_name("IP_PORT")
                .takes_value(true)
                .help("the IP address and port to listen on. Default: 127.0.0.1:3000"),
        )
        .arg(
            Arg::with_name(ARG_DEFAULT_HOSTNAME)
                .long("hostname")
                .value_name("HOSTNAME")
                .takes_value(true)
                .help("the hostname (and the port if not :80) that is to be considered the default. Default: localhost:3000"),
        )
        .arg(
            Arg::with_name(ARG_TLS_CERT_FILE)
                .long("tls-cert")
                .value_name("TLS_CERT")
                .env("REQECHO_TLS_CERT")
                .takes_value(true)
                .help("the path to the certificate to use for https, if this is not set, normal http will be used. The cert should be in PEM format")
                .requires(ARG_TLS_KEY_FILE),
        )
        .arg(
            Arg::with_name(ARG_TLS_KEY_FILE)
                .long("tls-key")
                .value_name("TLS_KEY")
                .env("REQECHO_TLS_KEY")
                .takes_value(true)
                .help("the path to the certificate key to use for https, if this is not set, normal http will be used. The key should be in PKCS#8 format")
                .requires(ARG_TLS_CERT_FILE),
        )
        .arg(
            Arg::with_name(ARG_ENV_VARS)
                .long("env")
                .short("e")
                .value_name("ENV_VARS")
                .help(ENV_VAR_HELP)
                .takes_value(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name(ARG_ENV_FILES)
                .long("env-file")
                .takes_value(true)
                .value_name("ENV_FILE")
                .multiple(true)
                .help("Read a file of NAME=VALUE pairs and list them as extra server variables. Multiple files can be specified. See also '--env'."),
        )
}

pub async fn parse_command_line() -> anyhow::Result<EchoConfiguration> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let echo_app = echo_app_definition();

    let matches = echo_app.get_matches();
    parse_configuration_from(matches).await
}

pub async fn parse_configuration_from(
    matches: ArgMatches<'_>,
) -> anyhow::Result<EchoConfiguration> {
    let file_config = match matches.value_of(ARG_CONFIG_FILE) {
        Some(path) => read_config_file(Path::new(path)).await?,
        None => ConfigFile::default(),
    };
    let file_server = file_config.server.unwrap_or_default();

    let addr = match matches.value_of(ARG_LISTEN_ON) {
        Some(a) => a
            .parse()
            .with_context(|| format!("Invalid listen address {}", a))?,
        None => file_server.listen.unwrap_or(DEFAULT_LISTEN_ON),
    };

    tracing::info!(?addr, "Starting server");

    let hostname = matches
        .value_of(ARG_DEFAULT_HOSTNAME)
        .map(|h| h.to_owned())
        .or(file_server.hostname)
        .unwrap_or_else(|| DEFAULT_HOST.to_owned());

    let env_vars = merge_env_vars(&matches, file_config.env.unwrap_or_default())?;

    tracing::debug!(?env_vars, "Env vars are set");

    let tls_cert = matches
        .value_of(ARG_TLS_CERT_FILE)
        .map(PathBuf::from)
        .or(file_server.tls_cert);
    let tls_key = matches
        .value_of(ARG_TLS_KEY_FILE)
        .map(PathBuf::from)
        .or(file_server.tls_key);
    let tls_config = parse_tls_config(tls_cert, tls_key)?;

    Ok(EchoConfiguration {
        env_vars,
        http_configuration: HttpConfiguration {
            listen_on: addr,
            default_hostname: hostname,
            tls: tls_config,
        },
    })
}

fn parse_tls_config(
    tls_cert_file: Option<PathBuf>,
    tls_key_file: Option<PathBuf>,
) -> anyhow::Result<Option<TlsConfiguration>> {
    match (tls_cert_file, tls_key_file) {
        (Some(cert_path), Some(key_path)) => {
            if !cert_path.is_file() {
                Err(anyhow::anyhow!(
                    "TLS certificate file does not exist or is not a file"
                ))
            } else if !key_path.is_file() {
                Err(anyhow::anyhow!(
                    "TLS key file does not exist or is not a file"
                ))
            } else {
                Ok(Some(TlsConfiguration {
                    cert_path,
                    key_path,
                }))
            }
        }
        (None, None) => Ok(None),
        // clap enforces the pairing for flags, but the config file can
        // still supply only one half.
        _ => Err(anyhow::anyhow!(
            "Both a cert and key file should be set or neither should be set"
        )),
    }
}

/// Merge variables defined in the config file, env files, and the CLI.
/// Later sources win: `--env` beats `--env-file` beats the `[env]` table.
fn merge_env_vars(
    matches: &ArgMatches,
    mut env_vars: HashMap<String, String>,
) -> anyhow::Result<HashMap<String, String>> {
    if let Some(v) = matches.values_of(ARG_ENV_FILES) {
        let from_files =
            env_file_reader::read_files(&v.into_iter().collect::<Vec<&str>>())?;
        env_vars.extend(from_files);
    }

    if let Some(v) = matches.values_of(ARG_ENV_VARS) {
        let extras: HashMap<String, String> = v
            .into_iter()
            .map(parse_env_var)
            .collect::<anyhow::Result<_>>()?;
        env_vars.extend(extras);
    }
    Ok(env_vars)
}

fn parse_env_var(val: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = val
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid environment variable, did not find '='"))?;

    // A variable must have a key, but can have an empty value (i.e. `-e =bar`
    // is rejected, `-e FOO=` is fine).
    if key.is_empty() {
        return Err(anyhow::anyhow!(
            "Environment variable must have a non-empty key"
        ));
    }

    // If the value starts and ends with a double or single quote, assume it is
    // a quoted value and strip the quotes
    let final_value = if value.starts_with('"') && value.ends_with('"') {
        value.trim_matches('"').to_owned()
    } else if value.starts_with('\'') && value.ends_with('\'') {
        value.trim_matches('\'').to_owned()
    } else {
        value.to_owned()
    };

    Ok((key.to_owned(), final_value))
}
