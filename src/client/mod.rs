pub mod connection;
pub mod metrics;
pub mod pool;

use crate::error::ClientError;
use crate::logger::Logger;
use crate::protocol::messages::TrustedFlag;
use crate::protocol::types::{
    BasicDerivation, BuildMode, BuildResult, BuildStatus, ContentAddressMethod, DerivedPath,
    DrvOutputId, GCOptions, GCResult, HashAlgo, KeyedBuildResult, KeyedValidPathInfo, Missing,
    OutputsSpec, Realisation, StorePath, SubstitutablePathInfo, ValidPathInfo,
};
use crate::protocol::{OpCode, ProtocolVersion};
use crate::serialization::store_requests::{
    AddSignaturesRequest, AddTextToStoreRequest, BuildPathsRequest, QuerySubstitutablePathInfosRequest,
    QueryValidPathsRequest, VerifyStoreRequest,
};
use crate::serialization::{Deserialize, Serialize};
use crate::settings::ClientSettings;
use pool::{ConnectionPool, PoolConfig, PooledConnectionGuard, UnixConnection};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use metrics::ClientMetrics;

/// A separate store used to read derivations, consulted by the
/// compatibility path of `build_paths_with_results` on old daemons.
///
/// Must not call back into the `RemoteStore` it is passed to.
#[allow(async_fn_in_trait)]
pub trait EvalStore {
    async fn static_derivation_output_map(
        &self,
        drv: &StorePath,
    ) -> Result<BTreeMap<String, Option<StorePath>>, ClientError>;
}

/// Remote store backed by a pool of worker-protocol connections.
pub struct RemoteStore {
    pool: ConnectionPool,
    path_info_cache: StdMutex<HashMap<StorePath, Option<ValidPathInfo>>>,
}

impl RemoteStore {
    /// A store over the given daemon socket with default settings.
    /// No connection is opened until the first operation.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self::with_config(socket_path, ClientSettings::default(), PoolConfig::default())
    }

    pub fn with_config(
        socket_path: impl Into<PathBuf>,
        settings: ClientSettings,
        config: PoolConfig,
    ) -> Self {
        Self {
            pool: ConnectionPool::new(socket_path.into(), settings, config),
            path_info_cache: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_logger(
        socket_path: impl Into<PathBuf>,
        settings: ClientSettings,
        config: PoolConfig,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            pool: ConnectionPool::with_logger(socket_path.into(), settings, config, logger),
            path_info_cache: StdMutex::new(HashMap::new()),
        }
    }

    pub fn uri(&self) -> &str {
        self.pool.uri()
    }

    /// Force the handshake without performing an operation.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _guard = self.pool.acquire().await?;
        Ok(())
    }

    /// The protocol version negotiated with the daemon.
    pub async fn get_protocol(&self) -> Result<ProtocolVersion, ClientError> {
        let guard = self.pool.acquire().await?;
        Ok(guard.version())
    }

    /// The daemon's own version string, known from protocol minor 33 on.
    pub async fn get_version(&self) -> Result<Option<String>, ClientError> {
        let mut guard = self.pool.acquire().await?;
        Ok(guard.connection().daemon_nix_version().map(str::to_string))
    }

    /// Whether the daemon trusts us, when it says (protocol minor 35).
    pub async fn is_trusted_client(&self) -> Result<Option<TrustedFlag>, ClientError> {
        let mut guard = self.pool.acquire().await?;
        Ok(guard.connection().remote_trusts_us())
    }

    // Path queries

    pub async fn is_valid_path(&self, path: &StorePath) -> Result<bool, ClientError> {
        self.execute(OpCode::IsValidPath, path).await
    }

    /// The subset of `paths` that is valid on the daemon.
    pub async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
        maybe_substitute: bool,
    ) -> Result<BTreeSet<StorePath>, ClientError> {
        let request = QueryValidPathsRequest {
            paths,
            maybe_substitute,
        };
        self.execute(OpCode::QueryValidPaths, &request).await
    }

    pub async fn query_all_valid_paths(&self) -> Result<BTreeSet<StorePath>, ClientError> {
        self.execute(OpCode::QueryAllValidPaths, &()).await
    }

    pub async fn query_substitutable_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, ClientError> {
        self.execute(OpCode::QuerySubstitutablePaths, paths).await
    }

    /// Substituter info for the given paths, keyed by path.  The map
    /// values carry the rendered content address where known, or an
    /// empty string.
    pub async fn query_substitutable_path_infos(
        &self,
        paths: &BTreeMap<StorePath, String>,
    ) -> Result<BTreeMap<StorePath, SubstitutablePathInfo>, ClientError> {
        if paths.is_empty() {
            return Ok(BTreeMap::new());
        }
        let request = QuerySubstitutablePathInfosRequest { paths };
        self.execute(OpCode::QuerySubstitutablePathInfos, &request)
            .await
    }

    /// Metadata for a path, or `None` if the path is not valid.
    ///
    /// Results are cached until the next `collect_garbage`.
    pub async fn query_path_info(
        &self,
        path: &StorePath,
    ) -> Result<Option<ValidPathInfo>, ClientError> {
        if let Some(cached) = self.path_info_cache.lock().unwrap().get(path) {
            return Ok(cached.clone());
        }

        let mut guard = self.pool.acquire().await?;
        let conn = guard.connection();

        let result = Self::query_path_info_on(conn, path).await;
        settle(&mut guard, &result);

        if let Ok(info) = &result {
            self.path_info_cache
                .lock()
                .unwrap()
                .insert(path.clone(), info.clone());
        }
        result
    }

    async fn query_path_info_on(
        conn: &mut UnixConnection,
        path: &StorePath,
    ) -> Result<Option<ValidPathInfo>, ClientError> {
        conn.send_op(OpCode::QueryPathInfo).await?;
        conn.write(path).await?;

        match conn.drain().await {
            Ok(()) => {}
            // Compatibility shim for daemons without a distinct "not
            // found" reply: they raise an error whose text contains
            // "is not valid".  Fragile, but mirrors what such daemons
            // force on every client.
            Err(ClientError::Remote(e)) if e.message.contains("is not valid") => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let valid: bool = conn.read().await?;
        if !valid {
            return Ok(None);
        }
        Ok(Some(conn.read::<ValidPathInfo>().await?))
    }

    pub async fn query_referrers(
        &self,
        path: &StorePath,
    ) -> Result<BTreeSet<StorePath>, ClientError> {
        self.execute(OpCode::QueryReferrers, path).await
    }

    pub async fn query_valid_derivers(
        &self,
        path: &StorePath,
    ) -> Result<BTreeSet<StorePath>, ClientError> {
        self.execute(OpCode::QueryValidDerivers, path).await
    }

    /// All known output paths of a derivation.
    pub async fn query_derivation_outputs(
        &self,
        drv: &StorePath,
    ) -> Result<BTreeSet<StorePath>, ClientError> {
        let guard = self.pool.acquire().await?;
        if guard.version().minor >= 22 {
            drop(guard);
            let map = self.query_derivation_output_map(drv).await?;
            Ok(map.into_values().flatten().collect())
        } else {
            let mut guard = guard;
            let conn = guard.connection();
            let result = Self::run_op(conn, OpCode::QueryDerivationOutputs, drv).await;
            settle(&mut guard, &result);
            result
        }
    }

    /// Output name to output path, where known.
    pub async fn query_derivation_output_map(
        &self,
        drv: &StorePath,
    ) -> Result<BTreeMap<String, Option<StorePath>>, ClientError> {
        let mut guard = self.pool.acquire().await?;
        let version = guard.version();
        if version.minor < 22 {
            return Err(ClientError::Unsupported {
                feature: "query_derivation_output_map",
                version,
            });
        }
        let conn = guard.connection();
        let result = Self::run_op(conn, OpCode::QueryDerivationOutputMap, drv).await;
        settle(&mut guard, &result);
        result
    }

    /// Like `query_derivation_output_map`, but overlaid on the output
    /// map statically known to an evaluation store.  Daemon answers win
    /// where they name a concrete path.
    pub async fn query_derivation_output_map_with<E: EvalStore>(
        &self,
        drv: &StorePath,
        eval_store: &E,
    ) -> Result<BTreeMap<String, Option<StorePath>>, ClientError> {
        let mut map = eval_store.static_derivation_output_map(drv).await?;
        for (name, path) in self.query_derivation_output_map(drv).await? {
            if path.is_some() {
                map.insert(name, path);
            } else {
                map.entry(name).or_insert(None);
            }
        }
        Ok(map)
    }

    pub async fn query_path_from_hash_part(
        &self,
        hash_part: &str,
    ) -> Result<Option<StorePath>, ClientError> {
        // An empty reply string means the hash part is unknown.
        self.execute(OpCode::QueryPathFromHashPart, hash_part).await
    }

    // Path additions

    /// Add a store object from a byte dump.
    ///
    /// On daemons from protocol minor 25 on, the dump is streamed in
    /// framed mode.  The dump source may itself call back into this
    /// store: pool capacity is raised for the duration of the stream to
    /// make room for the nested acquisition.
    pub async fn add_to_store_from_dump<S>(
        &self,
        source: &mut S,
        name: &str,
        method: ContentAddressMethod,
        hash_algo: HashAlgo,
        references: &BTreeSet<StorePath>,
        repair: bool,
    ) -> Result<KeyedValidPathInfo, ClientError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut guard = self.pool.acquire().await?;
        let version = guard.version();

        if version.minor >= 25 {
            let conn = guard.connection();
            let result = async {
                conn.send_op(OpCode::AddToStore).await?;
                conn.write(name).await?;
                conn.write(&method.render(hash_algo)).await?;
                conn.write(references).await?;
                conn.write(&repair).await?;
                Ok::<(), ClientError>(())
            }
            .await;
            poison_on_failure(&mut guard, &result);
            result?;

            // The dump source may call back into the store: make room
            // for the nested acquisition while the stream is live.
            let reservation = self.pool.reserve_capacity();
            let streamed = guard.connection().send_framed(source).await;
            drop(reservation);
            streamed?;

            let conn = guard.connection();
            let result = conn.read::<KeyedValidPathInfo>().await;
            settle(&mut guard, &result);
            result
        } else {
            let result = self
                .add_to_store_from_dump_legacy(&mut guard, source, name, method, hash_algo, references, repair)
                .await;
            settle(&mut guard, &result);
            let path = result?;

            // Release our connection to prevent a deadlock in
            // query_path_info.
            drop(guard);
            let info = self
                .query_path_info(&path)
                .await?
                .ok_or_else(|| ClientError::InvalidPath(path.clone()))?;
            Ok(KeyedValidPathInfo { path, info })
        }
    }

    /// Pre-1.25 upload: no framing, no repair, text data only as
    /// SHA-256.
    async fn add_to_store_from_dump_legacy<S>(
        &self,
        guard: &mut PooledConnectionGuard,
        source: &mut S,
        name: &str,
        method: ContentAddressMethod,
        hash_algo: HashAlgo,
        references: &BTreeSet<StorePath>,
        repair: bool,
    ) -> Result<StorePath, ClientError>
    where
        S: AsyncRead + Unpin + Send,
    {
        if repair {
            return Err(ClientError::Unimplemented(
                "repairing is not supported when building through the Nix daemon protocol < 1.25"
                    .to_string(),
            ));
        }

        let conn = guard.connection();
        match method {
            ContentAddressMethod::Text => {
                if hash_algo != HashAlgo::Sha256 {
                    return Err(ClientError::Unimplemented(format!(
                        "when adding text-hashed data called '{name}', only SHA-256 is supported but '{}' was given",
                        hash_algo.name()
                    )));
                }
                let mut text = Vec::new();
                source
                    .read_to_end(&mut text)
                    .await
                    .map_err(|e| ClientError::io("Failed to read text source", e))?;

                conn.send_op(OpCode::AddTextToStore).await?;
                let request = AddTextToStoreRequest {
                    name,
                    text: &text,
                    references,
                };
                conn.write(&request).await?;
                conn.drain().await?;
            }
            ContentAddressMethod::Flat | ContentAddressMethod::Recursive => {
                let recursive = method == ContentAddressMethod::Recursive;
                conn.send_op(OpCode::AddToStore).await?;
                conn.write(name).await?;
                // Backwards compatibility hack: "fixed" unless SHA-256
                // recursive.
                let fixed = !(hash_algo == HashAlgo::Sha256 && recursive);
                conn.write(&(fixed as u64)).await?;
                conn.write(&(recursive as u64)).await?;
                conn.write(hash_algo.name()).await?;

                let reservation = self.pool.reserve_capacity();
                let sent = async {
                    let conn = guard.connection();
                    if recursive {
                        conn.copy_raw(source).await?;
                    } else {
                        let mut contents = Vec::new();
                        source
                            .read_to_end(&mut contents)
                            .await
                            .map_err(|e| ClientError::io("Failed to read file source", e))?;
                        conn.write(contents.as_slice()).await?;
                    }
                    conn.drain().await
                }
                .await;
                drop(reservation);

                if let Err(e) = sent {
                    // The daemon probably died mid-upload; try one last
                    // event drain to surface its error before giving up.
                    // Either way the write half is broken.
                    if e.is_broken_pipe() {
                        guard.connection().mark_bad();
                        match guard.connection().process_stderr(None, None, false).await {
                            Ok(Some(daemon_err)) => return Err(ClientError::Remote(daemon_err)),
                            Ok(None) => {}
                            Err(drain_err) if drain_err.is_end_of_file() => {
                                tracing::debug!(
                                    "discarding EOF while draining events after broken pipe: {drain_err}"
                                );
                            }
                            Err(drain_err) => return Err(drain_err),
                        }
                    }
                    return Err(e);
                }
            }
        }

        guard.connection().read::<StorePath>().await
    }

    /// Add plain text with references; the path is content-addressed
    /// by SHA-256.
    pub async fn add_text_to_store(
        &self,
        name: &str,
        text: &[u8],
        references: &BTreeSet<StorePath>,
        repair: bool,
    ) -> Result<StorePath, ClientError> {
        let mut source = Cursor::new(text);
        let info = self
            .add_to_store_from_dump(
                &mut source,
                name,
                ContentAddressMethod::Text,
                HashAlgo::Sha256,
                references,
                repair,
            )
            .await?;
        Ok(info.path)
    }

    /// Add a store object from its NAR serialisation plus metadata.
    pub async fn add_to_store_nar<S>(
        &self,
        info: &KeyedValidPathInfo,
        source: &mut S,
        repair: bool,
        check_sigs: bool,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut guard = self.pool.acquire().await?;
        let version = guard.version();
        let conn = guard.connection();

        let result = async {
            conn.send_op(OpCode::AddToStoreNar).await?;
            conn.write(&info.path).await?;
            conn.write(&info.info.deriver).await?;
            conn.write(&info.info.nar_hash).await?;
            conn.write(&info.info.references).await?;
            conn.write(&info.info.registration_time).await?;
            conn.write(&info.info.nar_size).await?;
            conn.write(&info.info.ultimate).await?;
            conn.write(&info.info.signatures).await?;
            match &info.info.content_address {
                Some(ca) => conn.write(ca).await?,
                None => conn.write("").await?,
            }
            conn.write(&repair).await?;
            conn.write(&!check_sigs).await?;
            Ok::<(), ClientError>(())
        }
        .await;
        poison_on_failure(&mut guard, &result);
        result?;

        if version.minor >= 23 {
            let result = guard.connection().send_framed(source).await;
            settle(&mut guard, &result);
            result
        } else {
            // Old daemons pull the NAR themselves via READ events.
            let conn = guard.connection();
            let source = source as &mut (dyn AsyncRead + Unpin + Send);
            let result = match conn.process_stderr(None, Some(source), true).await {
                Ok(Some(err)) => Err(ClientError::Remote(err)),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            settle(&mut guard, &result);
            result
        }
    }

    /// Transfer several store objects in one request.  Falls back to
    /// per-path `add_to_store_nar` on daemons older than minor 32.
    pub async fn add_multiple_to_store<S>(
        &self,
        paths: Vec<(KeyedValidPathInfo, S)>,
        repair: bool,
        check_sigs: bool,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let mut guard = self.pool.acquire().await?;
        let version = guard.version();

        if version.minor >= 32 {
            let conn = guard.connection();
            let result = async {
                conn.send_op(OpCode::AddMultipleToStore).await?;
                conn.write(&repair).await?;
                conn.write(&!check_sigs).await?;
                Ok::<(), ClientError>(())
            }
            .await;
            poison_on_failure(&mut guard, &result);
            result?;

            // One catenated framed stream: count, then per path its
            // metadata followed by its NAR.
            let mut header = Vec::new();
            (paths.len() as u64).serialize(&mut header, version).await?;
            let mut composed: Box<dyn AsyncRead + Unpin + Send> = Box::new(Cursor::new(header));
            for (info, nar) in paths {
                let mut meta = Vec::new();
                info.serialize(&mut meta, version).await?;
                composed = Box::new(composed.chain(Cursor::new(meta)).chain(nar));
            }

            let result = guard.connection().send_framed(&mut composed).await;
            settle(&mut guard, &result);
            result
        } else {
            drop(guard);
            for (info, mut nar) in paths {
                self.add_to_store_nar(&info, &mut nar, repair, check_sigs)
                    .await?;
            }
            Ok(())
        }
    }

    // Build control

    pub async fn build_paths(
        &self,
        paths: &[DerivedPath],
        mode: BuildMode,
    ) -> Result<(), ClientError> {
        let request = BuildPathsRequest {
            paths,
            mode: mode as u64,
        };
        let _: u64 = self.execute(OpCode::BuildPaths, &request).await?;
        Ok(())
    }

    /// Build paths and report one result per requested path.
    ///
    /// Daemons older than minor 34 cannot answer this natively; the
    /// results are synthesised from `build_paths` plus output-map
    /// queries.  The handle is released before recursing so a pool of
    /// size one cannot deadlock on itself.
    pub async fn build_paths_with_results(
        &self,
        paths: &[DerivedPath],
        mode: BuildMode,
    ) -> Result<Vec<KeyedBuildResult>, ClientError> {
        match self.build_paths_with_results_native(paths, mode).await? {
            Some(results) => Ok(results),
            None => {
                self.build_paths(paths, mode).await?;
                self.synthesize_build_results(paths, None::<&NoEvalStore>)
                    .await
            }
        }
    }

    /// Like `build_paths_with_results`, with an evaluation store to
    /// resolve statically-known outputs on old daemons.
    pub async fn build_paths_with_results_using<E: EvalStore>(
        &self,
        paths: &[DerivedPath],
        mode: BuildMode,
        eval_store: &E,
    ) -> Result<Vec<KeyedBuildResult>, ClientError> {
        match self.build_paths_with_results_native(paths, mode).await? {
            Some(results) => Ok(results),
            None => {
                self.build_paths(paths, mode).await?;
                self.synthesize_build_results(paths, Some(eval_store)).await
            }
        }
    }

    /// Returns `None` when the daemon is too old for the native
    /// operation, after releasing the connection.
    async fn build_paths_with_results_native(
        &self,
        paths: &[DerivedPath],
        mode: BuildMode,
    ) -> Result<Option<Vec<KeyedBuildResult>>, ClientError> {
        let mut guard = self.pool.acquire().await?;
        if guard.version().minor < 34 {
            return Ok(None);
        }

        let request = BuildPathsRequest {
            paths,
            mode: mode as u64,
        };
        let conn = guard.connection();
        let result = Self::run_op(conn, OpCode::BuildPathsWithResults, &request).await;
        settle(&mut guard, &result);
        result.map(Some)
    }

    async fn synthesize_build_results<E: EvalStore>(
        &self,
        paths: &[DerivedPath],
        eval_store: Option<&E>,
    ) -> Result<Vec<KeyedBuildResult>, ClientError> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            match path {
                DerivedPath::Opaque(_) => results.push(KeyedBuildResult {
                    path: path.clone(),
                    result: BuildResult::with_status(BuildStatus::Substituted),
                }),
                DerivedPath::Built { drv, outputs } => {
                    let output_map = match eval_store {
                        Some(eval) => self.query_derivation_output_map_with(drv, eval).await?,
                        None => self.query_derivation_output_map(drv).await?,
                    };

                    let mut result = BuildResult::with_status(BuildStatus::Built);
                    for (name, out_path) in output_map {
                        let wanted = match outputs {
                            OutputsSpec::All => true,
                            OutputsSpec::Names(names) => names.contains(&name),
                        };
                        if !wanted {
                            continue;
                        }
                        // The static derivation hash is unknown here, so
                        // the synthetic realisation is keyed by the
                        // derivation path instead.
                        let id = DrvOutputId {
                            drv_hash: drv.to_string(),
                            output_name: name.clone(),
                        };
                        match out_path {
                            Some(p) => {
                                result.built_outputs.insert(name, Realisation::unsigned(id, p));
                            }
                            None => return Err(ClientError::MissingRealisation(id)),
                        }
                    }
                    results.push(KeyedBuildResult {
                        path: path.clone(),
                        result,
                    });
                }
            }
        }
        Ok(results)
    }

    /// Build one derivation whose inputs are already present.
    pub async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
        mode: BuildMode,
    ) -> Result<BuildResult, ClientError> {
        let mut guard = self.pool.acquire().await?;
        let conn = guard.connection();
        let result = async {
            conn.send_op(OpCode::BuildDerivation).await?;
            conn.write(drv_path).await?;
            conn.write(drv).await?;
            conn.write(&(mode as u64)).await?;
            conn.drain().await?;
            conn.read::<BuildResult>().await
        }
        .await;
        settle(&mut guard, &result);
        result
    }

    pub async fn ensure_path(&self, path: &StorePath) -> Result<(), ClientError> {
        let _: u64 = self.execute(OpCode::EnsurePath, path).await?;
        Ok(())
    }

    // Garbage collection

    pub async fn add_temp_root(&self, path: &StorePath) -> Result<(), ClientError> {
        let _: u64 = self.execute(OpCode::AddTempRoot, path).await?;
        Ok(())
    }

    /// Register an indirect GC root at the given file system path.
    pub async fn add_indirect_root(&self, path: &str) -> Result<(), ClientError> {
        let _: u64 = self.execute(OpCode::AddIndirectRoot, path).await?;
        Ok(())
    }

    /// All GC roots, as a map from the rooting symlink to its target.
    pub async fn find_roots(&self) -> Result<BTreeMap<String, StorePath>, ClientError> {
        self.execute(OpCode::FindRoots, &()).await
    }

    /// Run garbage collection.  Invalidates the path info cache, since
    /// any cached path may just have been deleted.
    pub async fn collect_garbage(&self, options: &GCOptions) -> Result<GCResult, ClientError> {
        let result = self.execute(OpCode::CollectGarbage, options).await;
        if result.is_ok() {
            self.path_info_cache.lock().unwrap().clear();
        }
        result
    }

    pub async fn optimise_store(&self) -> Result<(), ClientError> {
        let _: u64 = self.execute(OpCode::OptimiseStore, &()).await?;
        Ok(())
    }

    /// Verify store consistency; returns true if errors remain.
    pub async fn verify_store(
        &self,
        check_contents: bool,
        repair: bool,
    ) -> Result<bool, ClientError> {
        let request = VerifyStoreRequest {
            check_contents,
            repair,
        };
        self.execute(OpCode::VerifyStore, &request).await
    }

    // Signatures and realisations

    pub async fn add_signatures(
        &self,
        path: &StorePath,
        signatures: &[String],
    ) -> Result<(), ClientError> {
        let request = AddSignaturesRequest { path, signatures };
        let _: u64 = self.execute(OpCode::AddSignatures, &request).await?;
        Ok(())
    }

    pub async fn register_drv_output(&self, realisation: &Realisation) -> Result<(), ClientError> {
        let mut guard = self.pool.acquire().await?;
        let version = guard.version();
        let conn = guard.connection();
        let result = async {
            conn.send_op(OpCode::RegisterDrvOutput).await?;
            if version.minor < 31 {
                conn.write(&realisation.id.to_string()).await?;
                conn.write(&realisation.out_path).await?;
            } else {
                conn.write(realisation).await?;
            }
            conn.drain().await
        }
        .await;
        settle(&mut guard, &result);
        result
    }

    pub async fn query_realisation(
        &self,
        id: &DrvOutputId,
    ) -> Result<Option<Realisation>, ClientError> {
        let mut guard = self.pool.acquire().await?;
        let version = guard.version();
        if version.minor < 27 {
            tracing::warn!(
                "the daemon is too old to support content-addressed derivations, please upgrade it to 2.4"
            );
            return Ok(None);
        }

        let conn = guard.connection();
        let result = async {
            conn.send_op(OpCode::QueryRealisation).await?;
            conn.write(&id.to_string()).await?;
            conn.drain().await?;

            if version.minor < 31 {
                let out_paths: BTreeSet<StorePath> = conn.read().await?;
                Ok(out_paths
                    .into_iter()
                    .next()
                    .map(|path| Realisation::unsigned(id.clone(), path)))
            } else {
                let realisations: BTreeSet<Realisation> = conn.read().await?;
                Ok(realisations.into_iter().next())
            }
        }
        .await;
        settle(&mut guard, &result);
        result
    }

    pub async fn query_missing(&self, targets: &[DerivedPath]) -> Result<Missing, ClientError> {
        self.execute(OpCode::QueryMissing, targets).await
    }

    /// Upload a build log for a derivation.
    pub async fn add_build_log(&self, drv: &StorePath, log: &[u8]) -> Result<(), ClientError> {
        let mut guard = self.pool.acquire().await?;
        let conn = guard.connection();

        let result = async {
            conn.send_op(OpCode::AddBuildLog).await?;
            conn.write(drv).await?;
            Ok::<(), ClientError>(())
        }
        .await;
        poison_on_failure(&mut guard, &result);
        result?;

        let mut source = Cursor::new(log);
        guard.connection().send_framed(&mut source).await?;

        let conn = guard.connection();
        let result = conn.read::<u64>().await;
        settle(&mut guard, &result);
        result.map(|_| ())
    }

    /// One operation following the common template: op code, request,
    /// event drain, reply.
    async fn execute<Req, Resp>(&self, op: OpCode, request: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: Deserialize,
    {
        let mut guard = self.pool.acquire().await?;
        let result = Self::run_op(guard.connection(), op, request).await;
        settle(&mut guard, &result);
        result
    }

    async fn run_op<Req, Resp>(
        conn: &mut UnixConnection,
        op: OpCode,
        request: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: Deserialize,
    {
        conn.send_op(op).await?;
        conn.write(request).await?;
        conn.drain().await?;
        conn.read().await
    }
}

/// Placeholder eval store for the plain `build_paths_with_results`.
struct NoEvalStore;

impl EvalStore for NoEvalStore {
    async fn static_derivation_output_map(
        &self,
        _drv: &StorePath,
    ) -> Result<BTreeMap<String, Option<StorePath>>, ClientError> {
        Ok(BTreeMap::new())
    }
}

/// Poisoning for an intermediate phase of an operation: failures that
/// desynchronise the stream mark the connection bad, everything else
/// leaves it mid-exchange.
fn poison_on_failure<T>(guard: &mut PooledConnectionGuard, result: &Result<T, ClientError>) {
    if let Err(e) = result {
        if e.poisons() {
            guard.connection().mark_bad();
        }
    }
}

/// Bookkeeping at the end of an operation: a clean result (or a remote
/// error, which concludes the exchange in-band) leaves the connection
/// reusable; a poisoning failure marks it bad.  Anything else keeps the
/// busy flag set so the pool drops the connection on release.
fn settle<T>(guard: &mut PooledConnectionGuard, result: &Result<T, ClientError>) {
    let conn = guard.connection();
    match result {
        Ok(_) | Err(ClientError::Remote(_)) => conn.finish_op(),
        Err(e) if e.poisons() => conn.mark_bad(),
        Err(_) => {}
    }
}
