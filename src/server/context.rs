// src/server/context.rs

//! Builds the runtime from a validated configuration: registry, shared
//! snapshot channels and their collectors, worker pool, user cache
//! refresher and bound listeners.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::{Config, FilterConfig, TlsConfig};
use crate::core::filter::insert_stream::{InsertStreamConfig, InsertStreamFilter};
use crate::core::filter::lua::{LuaFilter, LuaFilterConfig};
use crate::core::filter::optimistic_trx::{OptimisticTrxConfig, OptimisticTrxFilter};
use crate::core::filter::query_log::{LogMode, QueryLogConfig, QueryLogFilter};
use crate::core::filter::regex_rewrite::{RegexRewriteConfig, RegexRewriteFilter};
use crate::core::filter::tee::{TeeConfig, TeeFilter};
use crate::core::filter::top_queries::{TopQueriesConfig, TopQueriesFilter};
use crate::core::filter::{FilterModule, SessionScope};
use crate::core::monitor::{
    apply_update, ClusterSnapshot, ClusterUpdate, ServerSnapshot, ServerStatusFlags,
};
use crate::core::protocol::proxy_header::AllowedNetworks;
use crate::core::session::SessionConfig;
use crate::core::shared::Collector;
use crate::core::state::{Registry, Server, Service};
use crate::core::users::{
    native_password_hash, AccountSource, HostPattern, UserCacheRefresher, UserDatabase, UserEntry,
};
use crate::core::worker::{WorkerPool, WorkerSeed};
use crate::core::SqlGateError;

/// One listener bound and ready to accept.
pub struct BoundListener {
    pub name: String,
    pub listener: TcpListener,
    pub session_config: SessionConfig,
}

/// Everything `server::run` drives.
pub struct ServerContext {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub workers: Arc<WorkerPool>,
    pub listeners: Vec<BoundListener>,
    pub collector_threads: Vec<std::thread::JoinHandle<()>>,
}

/// Builds the whole runtime. Ordering matters: shared channels first, then
/// workers (which hold per-worker views), then registry wiring, then
/// listeners.
pub async fn build(config: Config) -> Result<ServerContext> {
    let registry = Registry::new();

    for server in &config.servers {
        registry.servers.insert(
            server.name.clone(),
            Arc::new(Server::new(
                server.name.clone(),
                server.address.clone(),
                server.port,
            )),
        );
    }

    for filter in &config.filters {
        let module = build_filter(filter)
            .map_err(|e| anyhow!("building filter '{}': {e}", filter.name()))?;
        registry.filters.insert(filter.name().to_string(), module);
    }

    for service in &config.services {
        let servers = service
            .servers
            .iter()
            .map(|name| {
                registry
                    .server(name)
                    .ok_or_else(|| anyhow!("service '{}': unknown server '{name}'", service.name))
            })
            .collect::<Result<Vec<_>>>()?;
        let filters = service
            .filters
            .iter()
            .map(|name| {
                registry
                    .filters
                    .get(name)
                    .map(|f| f.clone())
                    .ok_or_else(|| anyhow!("service '{}': unknown filter '{name}'", service.name))
            })
            .collect::<Result<Vec<_>>>()?;
        registry.services.insert(
            service.name.clone(),
            Arc::new(Service {
                name: service.name.clone(),
                config: service.clone(),
                servers,
                filters,
            }),
        );
    }

    // Shared snapshot channels: one slot per potential worker plus one for
    // the registry (admin mutations and monitor feed) and one for the user
    // refresher.
    let slots = config.max_threads + 1;
    let (status_collector, mut status_views) = Collector::<ClusterSnapshot, ClusterUpdate, _>::new(
        ClusterSnapshot::default(),
        slots,
        256,
        apply_update,
    );
    let (user_collector, mut user_views) = Collector::<UserDatabase, UserDatabase, _>::new(
        UserDatabase::default(),
        slots,
        16,
        |master: &mut UserDatabase, update: UserDatabase| *master = update,
    );

    let registry_status = status_views
        .pop()
        .ok_or_else(|| anyhow!("no status slot for the registry"))?;
    let refresher_users = user_views
        .pop()
        .ok_or_else(|| anyhow!("no user slot for the refresher"))?;
    registry.set_status_channel(registry_status.clone());

    // Seed initial server status so routing works before a monitor
    // publishes.
    for server in &config.servers {
        let mut flags = ServerStatusFlags::empty();
        match server.initial_status.as_deref() {
            Some("master") => flags = ServerStatusFlags::RUNNING | ServerStatusFlags::MASTER,
            Some("slave") => flags = ServerStatusFlags::RUNNING | ServerStatusFlags::SLAVE,
            Some("down") | None => {}
            Some(other) => warn!(server = %server.name, "ignoring initial_status '{other}'"),
        }
        registry_status.send_update(ClusterUpdate::Server(
            server.name.clone(),
            ServerSnapshot {
                flags,
                ..ServerSnapshot::default()
            },
        ));
    }

    let collector_threads = vec![
        status_collector.spawn("status-collector"),
        user_collector.spawn("user-collector"),
    ];

    // Worker seeds, one per provisioned slot.
    let seeds: Vec<WorkerSeed> = status_views
        .into_iter()
        .zip(user_views)
        .enumerate()
        .map(|(id, (servers, users))| WorkerSeed {
            id,
            inbox_capacity: config.inbox_capacity,
            pool_ttl: config.pool.ttl,
            pool_max_per_key: config.pool.max_per_server,
            users,
            servers,
        })
        .collect();
    let workers = Arc::new(WorkerPool::new(seeds, config.threads));
    registry.set_workers(workers.clone());

    // User cache refresher.
    let source: Arc<dyn AccountSource> = Arc::new(FileAccountSource {
        path: config.users.file.clone(),
    });
    let (refresher, refresh_handle) = UserCacheRefresher::new(
        source,
        refresher_users,
        config.users.refresh_interval,
        config.users.refresh_limit,
        config.users.refresh_window,
    );
    registry.set_user_refresh(refresh_handle);
    tokio::spawn(refresher.run());

    // Listeners.
    let mut listeners = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        let service = registry
            .service(&listener.service)
            .ok_or_else(|| anyhow!("listener '{}': unknown service", listener.name))?;
        let proxy_networks = listener
            .proxy_networks
            .as_deref()
            .map(AllowedNetworks::parse)
            .transpose()
            .map_err(|e| anyhow!("listener '{}': {e}", listener.name))?;
        let tls = listener.tls.as_ref().map(load_tls).transpose()?;
        let tls_slot = Arc::new(arc_swap::ArcSwapOption::from(tls.map(Arc::new)));
        registry.listeners.insert(
            listener.name.clone(),
            crate::core::state::ListenerRuntime {
                config: listener.clone(),
                tls_slot: tls_slot.clone(),
            },
        );
        let bind = format!("{}:{}", listener.address, listener.port);
        let socket = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("binding listener '{}' on {bind}", listener.name))?;
        info!(listener = %listener.name, %bind, service = %listener.service, "listening");
        listeners.push(BoundListener {
            name: listener.name.clone(),
            listener: socket,
            session_config: SessionConfig {
                service,
                registry: registry.clone(),
                server_version: listener.version_string.clone(),
                proxy_networks,
                passthrough_auth: listener.passthrough_auth,
                tls: tls_slot,
                low_water: config.watermarks.low,
                high_water: config.watermarks.high,
            },
        });
    }

    Ok(ServerContext {
        config,
        registry,
        workers,
        listeners,
        collector_threads,
    })
}

/// Builds one filter module from its typed configuration.
pub fn build_filter(config: &FilterConfig) -> Result<Arc<dyn FilterModule>, SqlGateError> {
    let module: Arc<dyn FilterModule> = match config {
        FilterConfig::Regexfilter {
            name,
            pattern,
            replace,
            case_insensitive,
            extended,
            source,
            user,
            log_file,
            log_trace,
            growth_factor,
        } => Arc::new(RegexRewriteFilter::new(
            name,
            RegexRewriteConfig {
                pattern: pattern.clone(),
                replace: replace.clone(),
                case_insensitive: *case_insensitive,
                extended: *extended,
                scope: SessionScope {
                    source: source.clone(),
                    user: user.clone(),
                },
                log_file: log_file.clone(),
                log_trace: *log_trace,
                growth_factor: *growth_factor,
            },
        )?),
        FilterConfig::Tee {
            name,
            target,
            pattern,
            exclude,
            source,
            user,
            sync,
        } => Arc::new(TeeFilter::new(
            name,
            TeeConfig {
                target: target.clone(),
                match_pattern: pattern.clone(),
                exclude_pattern: exclude.clone(),
                scope: SessionScope {
                    source: source.clone(),
                    user: user.clone(),
                },
                sync: *sync,
            },
        )?),
        FilterConfig::Insertstream { name, source, user } => Arc::new(InsertStreamFilter::new(
            name,
            InsertStreamConfig {
                scope: SessionScope {
                    source: source.clone(),
                    user: user.clone(),
                },
            },
        )),
        FilterConfig::Topfilter {
            name,
            count,
            filebase,
            pattern,
            exclude,
            source,
            user,
        } => Arc::new(TopQueriesFilter::new(
            name,
            TopQueriesConfig {
                count: *count,
                filebase: filebase.clone(),
                match_pattern: pattern.clone(),
                exclude_pattern: exclude.clone(),
                scope: SessionScope {
                    source: source.clone(),
                    user: user.clone(),
                },
            },
        )?),
        FilterConfig::Qlafilter {
            name,
            filebase,
            unified,
            separator,
            pattern,
            exclude,
            source,
            user,
        } => Arc::new(QueryLogFilter::new(
            name,
            QueryLogConfig {
                filebase: filebase.clone(),
                mode: if *unified {
                    LogMode::Unified
                } else {
                    LogMode::Session
                },
                separator: separator.clone(),
                match_pattern: pattern.clone(),
                exclude_pattern: exclude.clone(),
                scope: SessionScope {
                    source: source.clone(),
                    user: user.clone(),
                },
            },
        )?),
        FilterConfig::Luafilter {
            name,
            global_script,
            session_script,
        } => Arc::new(LuaFilter::new(
            name,
            LuaFilterConfig {
                global_script: global_script.clone(),
                session_script: session_script.clone(),
            },
        )?),
        FilterConfig::Optimistictrx { name } => {
            Arc::new(OptimisticTrxFilter::new(name, OptimisticTrxConfig::default()))
        }
    };
    Ok(module)
}

/// Admin `reload tls`: re-reads the certificate material of every TLS
/// listener and swaps the acceptors in place; established sessions keep
/// their old sessions, new handshakes use the fresh material.
pub fn reload_tls(registry: &Registry) -> Result<()> {
    for entry in registry.listeners.iter() {
        let runtime = entry.value();
        if let Some(tls) = &runtime.config.tls {
            let acceptor = load_tls(tls)
                .with_context(|| format!("reloading TLS for listener '{}'", entry.key()))?;
            runtime.tls_slot.store(Some(Arc::new(acceptor)));
            info!(listener = %entry.key(), "TLS material reloaded");
        }
    }
    Ok(())
}

fn load_tls(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&config.cert).with_context(|| format!("opening cert '{}'", config.cert))?,
    ))
    .collect::<std::io::Result<Vec<_>>>()
    .context("reading certificate chain")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(&config.key).with_context(|| format!("opening key '{}'", config.key))?,
    ))
    .context("reading private key")?
    .ok_or_else(|| anyhow!("no private key in '{}'", config.key))?;
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS configuration")?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Account file format: a list of `[[users]]` tables.
#[derive(Debug, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<UserFileEntry>,
}

#[derive(Debug, Deserialize)]
struct UserFileEntry {
    user: String,
    #[serde(default = "default_any_host")]
    host: String,
    /// Cleartext password; hashed at load time.
    password: Option<String>,
    /// Alternatively, the hex SHA1(SHA1(password)) as the directory stores
    /// it.
    password_hash: Option<String>,
    default_db: Option<String>,
    #[serde(default)]
    grants: Vec<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    require_ssl: bool,
}

fn default_any_host() -> String {
    "%".to_string()
}

/// The built-in file-backed account source: the seed/fallback directory
/// when no live cluster directory is wired in.
pub struct FileAccountSource {
    pub path: Option<String>,
}

#[async_trait]
impl AccountSource for FileAccountSource {
    async fn fetch_all(&self) -> Result<Vec<UserEntry>, SqlGateError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let raw = std::fs::read_to_string(path)?;
        let parsed: UsersFile = toml::from_str(&raw)
            .map_err(|e| SqlGateError::Config(format!("parsing users file '{path}': {e}")))?;
        let mut entries = Vec::with_capacity(parsed.users.len());
        for user in parsed.users {
            let auth_token_hash = match (&user.password, &user.password_hash) {
                (Some(password), _) => native_password_hash(password),
                (None, Some(hash)) => hex::decode(hash).map_err(|_| {
                    SqlGateError::Config(format!("bad password_hash for user '{}'", user.user))
                })?,
                (None, None) => Vec::new(),
            };
            entries.push(UserEntry {
                user: user.user,
                host: HostPattern::parse(&user.host),
                auth_plugin: crate::core::session::auth::NATIVE_PLUGIN.to_string(),
                auth_token_hash,
                default_db: user.default_db,
                grants: user.grants,
                roles: user.roles,
                require_ssl: user.require_ssl,
            });
        }
        Ok(entries)
    }
}
