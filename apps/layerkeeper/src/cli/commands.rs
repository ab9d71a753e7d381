//! # CLI Command Implementations
//!
//! Each command opens the session, runs one read or one unit of work, and
//! prints either a human summary or, with `--json-mode`, the JSON value.

use super::{
    AttrCommand, Backend, CiCommand, LayerCommand, PredicateCommand, RelationCommand,
    TraitCommand, UserArg, WriteTarget,
};
use crate::api;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::target::{read_set, relation_key, split_ids, write_target};
use chrono::{DateTime, Utc};
use layerkeeper_core::{
    AttributeModel, AttributeValue, AttributeValueType, CiId, CiModel, CiSelection,
    EffectiveTraitEngine, LayerId, LayerModel, LayerSet, LayeredWriter, MergeEngine,
    PolicyOutcome, PredicateId, PredicateModel, RecordReader, Session, StoreError, TimeThreshold,
    TraitId,
    changeset::ChangesetModel,
    export::{LayerExport, encode_export, export_digest, import_layer},
};
use serde::Serialize;
use std::path::{Path, PathBuf};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum file size for import (500 MB).
const MAX_IMPORT_FILE_SIZE: u64 = 500 * 1024 * 1024;

fn validate_file_size(path: &Path, max_size: u64) -> Result<(), AppError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| AppError::Io(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(AppError::Input(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and require a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, AppError> {
    let canonical = path
        .canonicalize()
        .map_err(|e| AppError::Io(format!("Invalid file path '{}': {}", path.display(), e)))?;

    if !canonical.is_file() {
        return Err(AppError::Io(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Canonicalize the parent of an output path and require a directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, AppError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        AppError::Io(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(AppError::Io(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| AppError::Io("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Global flags and the loaded configuration.
#[derive(Debug)]
pub struct Context {
    pub database: PathBuf,
    pub backend: Backend,
    pub json_mode: bool,
    pub config: AppConfig,
}

impl Context {
    /// Open the session for the selected backend.
    pub fn open(&self) -> Result<Session, AppError> {
        match self.backend {
            Backend::Redb => Ok(Session::with_redb(&self.database)?),
            Backend::Memory => {
                tracing::warn!("memory backend: changes are discarded on exit");
                Ok(Session::new())
            }
        }
    }

    /// Print `value` as pretty JSON in JSON mode, else run `human`.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> Result<(), AppError> {
        if self.json_mode {
            let text = serde_json::to_string_pretty(value)
                .map_err(|e| AppError::Input(format!("JSON output: {}", e)))?;
            println!("{}", text);
        } else {
            human();
        }
        Ok(())
    }
}

fn threshold(at: Option<DateTime<Utc>>) -> TimeThreshold {
    at.map_or(TimeThreshold::Latest, TimeThreshold::AsOf)
}

fn describe<R>(outcome: &PolicyOutcome<R>) -> &'static str {
    match outcome {
        PolicyOutcome::Written(_) => "written",
        PolicyOutcome::Unchanged(_) => "unchanged",
        PolicyOutcome::Skipped => "skipped, lower layers already hold the value",
    }
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create a new database, registering the meta write layer.
pub fn cmd_init(ctx: &Context, force: bool) -> Result<(), AppError> {
    if ctx.backend == Backend::Redb && ctx.database.exists() {
        if !force {
            return Err(AppError::Input(
                "Database already exists. Use --force to overwrite.".to_string(),
            ));
        }
        std::fs::remove_file(&ctx.database)
            .map_err(|e| AppError::Io(format!("Remove {}: {}", ctx.database.display(), e)))?;
    }

    let meta = ctx.config.meta_configuration()?;
    let mut session = ctx.open()?;
    let mut uow = session.begin(ctx.config.user_id())?;
    LayerModel::create_layer_if_not_exists(&mut uow, &meta.write_layer, "configuration records")?;
    uow.commit()?;

    match ctx.backend {
        Backend::Redb => println!("Initialized new redb database at {:?}", ctx.database),
        Backend::Memory => println!("Initialized in-memory database (not persisted)"),
    }
    Ok(())
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server. Flags override the `[server]` section.
pub async fn cmd_server(
    ctx: Context,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), AppError> {
    let session = ctx.open()?;
    let host = host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = port.unwrap_or(ctx.config.server.port);

    println!("layerkeeper server starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", host);
    println!("  Port:     {}", port);
    println!("  Backend:  {}", ctx.backend);
    println!("  Database: {:?}", ctx.database);
    println!("  Meta:     {}", ctx.config.meta.layers.join(","));
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{}:{}", host, port);
    api::run_server(&addr, session, ctx.config).await
}

// =============================================================================
// LAYER COMMANDS
// =============================================================================

pub fn cmd_layer(ctx: &Context, command: LayerCommand) -> Result<(), AppError> {
    let mut session = ctx.open()?;
    match command {
        LayerCommand::Create {
            id,
            description,
            user,
        } => {
            let id = LayerId::new(id)?;
            let mut uow = session.begin(ctx.config.user_or(user.user))?;
            let (layer, created) =
                LayerModel::create_layer_if_not_exists(&mut uow, &id, &description)?;
            uow.commit()?;
            ctx.emit(&layer, || {
                if created {
                    println!("Created layer {}", layer.id);
                } else {
                    println!("Layer {} already exists", layer.id);
                }
            })
        }
        LayerCommand::List => {
            let view = session.read()?;
            let layers = LayerModel::all_layers(view.reader())?;
            ctx.emit(&layers, || {
                if layers.is_empty() {
                    println!("No layers");
                }
                for layer in &layers {
                    println!("{:<24} {}", layer.id, layer.description);
                }
            })
        }
        LayerCommand::Stats { id } => {
            let view = session.read()?;
            let stats = LayerModel::statistics(view.reader(), &LayerId::new(id)?)?;
            ctx.emit(&stats, || {
                println!("Layer {}", stats.layer);
                println!("==================");
                println!("Attribute records: {}", stats.attribute_records);
                println!("Relation records:  {}", stats.relation_records);
                println!("Changesets:        {}", stats.changesets);
                if let Some(latest) = stats.latest_change {
                    println!("Latest change:     {}", latest);
                }
            })
        }
        LayerCommand::Delete { id, user } => {
            let id = LayerId::new(id)?;
            let mut uow = session.begin(ctx.config.user_or(user.user))?;
            let deleted = LayerModel::try_delete_layer(&mut uow, &id)?;
            uow.commit()?;
            ctx.emit(&serde_json::json!({ "layer": id, "deleted": deleted }), || {
                if deleted {
                    println!("Deleted layer {}", id);
                } else {
                    println!("Layer {} still holds records, not deleted", id);
                }
            })
        }
    }
}

// =============================================================================
// CI COMMANDS
// =============================================================================

pub fn cmd_ci(ctx: &Context, command: CiCommand) -> Result<(), AppError> {
    let mut session = ctx.open()?;
    match command {
        CiCommand::Create { id, user } => {
            let id = id.as_deref().map(str::parse::<CiId>).transpose()?;
            let mut uow = session.begin(ctx.config.user_or(user.user))?;
            let id = CiModel::create_ci(&mut uow, id)?;
            uow.commit()?;
            ctx.emit(&serde_json::json!({ "id": id }), || {
                println!("Created CI {}", id);
            })
        }
        CiCommand::Show { id, read } => {
            let view = session.read()?;
            let ci: CiId = id.parse()?;
            if !CiModel::ci_exists_at(view.reader(), ci, threshold(read.at))? {
                return Err(StoreError::NotFound(format!("CI {}", ci)).into());
            }
            let layers = read_set(view.reader(), &read.layers)?;
            let merged = MergeEngine::get_merged_ci(view.reader(), ci, &layers, threshold(read.at))?;
            ctx.emit(&merged, || {
                println!("CI {} ({})", merged.id, merged.name().unwrap_or("unnamed"));
                println!("Layers: {}", merged.layers);
                println!();
                if merged.attributes.is_empty() {
                    println!("No attributes");
                }
                for (name, attribute) in &merged.attributes {
                    println!(
                        "  {} = {}  [{}]",
                        name,
                        attribute.value(),
                        attribute.record.layer
                    );
                }
            })
        }
        CiCommand::List => {
            let view = session.read()?;
            let ids = CiModel::all_ci_ids(view.reader())?;
            ctx.emit(&ids, || {
                for id in &ids {
                    println!("{}", id);
                }
                println!("{} CIs", ids.len());
            })
        }
    }
}

// =============================================================================
// ATTRIBUTE COMMANDS
// =============================================================================

pub fn cmd_attr(ctx: &Context, command: AttrCommand) -> Result<(), AppError> {
    let mut session = ctx.open()?;
    match command {
        AttrCommand::Set {
            ci,
            name,
            values,
            value_type,
            array,
            target,
            policy,
            user,
        } => {
            let ci: CiId = ci.parse()?;
            let value_type: AttributeValueType = value_type.parse()?;
            if value_type == AttributeValueType::Mask {
                return Err(AppError::Input(
                    "Masks are written by `attr remove --mask mask`".to_string(),
                ));
            }
            let value = AttributeValue::from_parts(value_type, array, &values)?;
            let mut uow = session.begin(ctx.config.user_or(user.user))?;
            let (layer, read_layers) = resolve_target(uow.reader(), &target)?;
            let outcome = LayeredWriter::insert_attribute(
                &mut uow,
                ci,
                &name,
                value,
                &layer,
                &read_layers,
                policy.into(),
            )?;
            uow.commit()?;
            let response = api::WriteResponse::from(outcome.clone());
            ctx.emit(&response, || {
                println!("{}.{} in {}: {}", ci, name, layer, describe(&outcome));
            })
        }
        AttrCommand::Remove {
            ci,
            name,
            target,
            mask,
            user,
        } => {
            let ci: CiId = ci.parse()?;
            let mut uow = session.begin(ctx.config.user_or(user.user))?;
            let (layer, read_layers) = resolve_target(uow.reader(), &target)?;
            let outcome = LayeredWriter::remove_attribute(
                &mut uow,
                ci,
                &name,
                &layer,
                &read_layers,
                mask.into(),
            )?;
            uow.commit()?;
            let response = api::WriteResponse::from(outcome.clone());
            ctx.emit(&response, || {
                let what = if response.mask { "masked" } else { "removed" };
                if response.changed {
                    println!("{}.{} {} in {}", ci, name, what, layer);
                } else {
                    println!("{}.{} in {}: {}", ci, name, layer, describe(&outcome));
                }
            })
        }
        AttrCommand::History { ci, name, layer } => {
            let view = session.read()?;
            let ci: CiId = ci.parse()?;
            let layer = LayerId::new(layer)?;
            LayerModel::get_layer(view.reader(), &layer)?;
            let history = AttributeModel::attribute_history(view.reader(), ci, &name, &layer)?;
            ctx.emit(&history, || {
                if history.is_empty() {
                    println!("No records for {}.{} in {}", ci, name, layer);
                }
                for record in &history {
                    println!(
                        "{}  {:<8} {}  ({})",
                        record.timestamp,
                        record.state.name(),
                        record.value,
                        record.changeset
                    );
                }
            })
        }
    }
}

fn resolve_target(
    reader: &dyn RecordReader,
    target: &WriteTarget,
) -> Result<(LayerId, LayerSet), AppError> {
    Ok(write_target(
        reader,
        &target.layer,
        &split_ids(&target.read_layers),
    )?)
}

// =============================================================================
// RELATION COMMANDS
// =============================================================================

pub fn cmd_relation(ctx: &Context, command: RelationCommand) -> Result<(), AppError> {
    let mut session = ctx.open()?;
    match command {
        RelationCommand::Add {
            from,
            to,
            predicate,
            target,
            policy,
            checked,
            user,
        } => {
            let key = relation_key(&from, &to, &predicate)?;
            let meta = if checked {
                Some(ctx.config.meta_configuration()?)
            } else {
                None
            };
            let mut uow = session.begin(ctx.config.user_or(user.user))?;
            let (layer, read_layers) = resolve_target(uow.reader(), &target)?;
            if let Some(meta) = meta {
                PredicateModel::ensure_predicate_known(uow.reader(), &key.predicate, &meta.layers)?;
            }
            let outcome =
                LayeredWriter::insert_relation(&mut uow, &key, &layer, &read_layers, policy.into())?;
            uow.commit()?;
            let response = api::WriteResponse::from(outcome.clone());
            ctx.emit(&response, || {
                println!("{} in {}: {}", key, layer, describe(&outcome));
            })
        }
        RelationCommand::Remove {
            from,
            to,
            predicate,
            target,
            mask,
            user,
        } => {
            let key = relation_key(&from, &to, &predicate)?;
            let mut uow = session.begin(ctx.config.user_or(user.user))?;
            let (layer, read_layers) = resolve_target(uow.reader(), &target)?;
            let outcome =
                LayeredWriter::remove_relation(&mut uow, &key, &layer, &read_layers, mask.into())?;
            uow.commit()?;
            let response = api::WriteResponse::from(outcome.clone());
            ctx.emit(&response, || {
                println!("{} in {}: {}", key, layer, describe(&outcome));
            })
        }
    }
}

// =============================================================================
// TRAIT COMMANDS
// =============================================================================

pub fn cmd_trait(ctx: &Context, command: TraitCommand) -> Result<(), AppError> {
    let session = ctx.open()?;
    let view = session.read()?;
    let meta = ctx.config.meta_configuration()?;
    let active = view.active_traits(&meta.layers)?;
    match command {
        TraitCommand::List => {
            let errors: std::collections::BTreeMap<String, String> = active
                .errors
                .iter()
                .map(|(id, e)| (id.to_string(), e.to_string()))
                .collect();
            let output = serde_json::json!({
                "traits": active.traits,
                "conflicts": active.conflicts,
                "errors": errors,
            });
            ctx.emit(&output, || {
                for generic in active.iter() {
                    println!(
                        "{:<32} {:?}  {} required / {} optional attributes, {} relations",
                        generic.id,
                        generic.origin,
                        generic.required_attributes.len(),
                        generic.optional_attributes.len(),
                        generic.required_relations.len() + generic.optional_relations.len()
                    );
                }
                for conflict in &active.conflicts {
                    println!(
                        "conflict in {}: '{}' kept from {}, dropped from {}",
                        conflict.trait_id,
                        conflict.identifier,
                        conflict.kept_from,
                        conflict.dropped_from
                    );
                }
                for (id, error) in &errors {
                    println!("excluded {}: {}", id, error);
                }
            })
        }
        TraitCommand::Effective { id, read } => {
            let trait_id = TraitId::new(id)?;
            let layers = read_set(view.reader(), &read.layers)?;
            let effective = EffectiveTraitEngine::get_effective_traits_for_trait(
                view.reader(),
                active.require(&trait_id)?,
                &CiSelection::All,
                &layers,
                threshold(read.at),
            )?;
            let effective: Vec<_> = effective.into_values().collect();
            ctx.emit(&effective, || {
                for et in &effective {
                    println!("{}", et.ci);
                }
                println!("{} CIs have trait {}", effective.len(), trait_id);
            })
        }
    }
}

// =============================================================================
// PREDICATE COMMANDS
// =============================================================================

pub fn cmd_predicate(ctx: &Context, command: PredicateCommand) -> Result<(), AppError> {
    let mut session = ctx.open()?;
    let meta = ctx.config.meta_configuration()?;
    match command {
        PredicateCommand::List => {
            let view = session.read()?;
            let predicates =
                PredicateModel::get_all(view.reader(), &meta.layers, TimeThreshold::Latest)?;
            ctx.emit(&predicates, || {
                for p in &predicates {
                    println!("{:<24} {} / {}", p.id, p.wording_from, p.wording_to);
                }
            })
        }
        PredicateCommand::Set {
            id,
            wording_from,
            wording_to,
            user,
        } => {
            let id = PredicateId::new(id)?;
            let mut uow = session.begin(ctx.config.user_or(user.user))?;
            LayerModel::create_layer_if_not_exists(
                &mut uow,
                &meta.write_layer,
                "configuration records",
            )?;
            let write =
                PredicateModel::insert_or_update(&mut uow, &meta, id.clone(), wording_from, wording_to)?;
            uow.commit()?;
            let output = serde_json::json!({ "ci": write.stored.ci, "changed": write.changed });
            ctx.emit(&output, || {
                if write.changed {
                    println!("Stored predicate {} in CI {}", id, write.stored.ci);
                } else {
                    println!("Predicate {} unchanged", id);
                }
            })
        }
    }
}

// =============================================================================
// CHANGESETS COMMAND
// =============================================================================

pub fn cmd_changesets(
    ctx: &Context,
    layers: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    ci: Option<&str>,
    limit: Option<usize>,
) -> Result<(), AppError> {
    let session = ctx.open()?;
    let view = session.read()?;
    let layers = read_set(view.reader(), layers)?;
    let cis = match ci {
        Some(ci) => CiSelection::specific([ci.parse::<CiId>()?]),
        None => CiSelection::All,
    };
    let changesets = ChangesetModel::changesets_in_timespan(
        view.reader(),
        from.unwrap_or(DateTime::<Utc>::MIN_UTC),
        to.unwrap_or_else(Utc::now),
        &layers,
        &cis,
        limit,
    )?;

    if ctx.json_mode {
        let detailed = changesets
            .iter()
            .map(|c| ChangesetModel::changeset_data(view.reader(), c.id))
            .collect::<Result<Vec<_>, _>>()?;
        return ctx.emit(&detailed, || {});
    }

    for changeset in &changesets {
        println!(
            "{}  {}  {:<16} {:<12} {:?}",
            changeset.timestamp, changeset.id, changeset.layer, changeset.user, changeset.origin
        );
    }
    println!("{} changesets", changesets.len());
    Ok(())
}

// =============================================================================
// EXPORT / IMPORT COMMANDS
// =============================================================================

/// Write the live content of a layer to a file.
pub fn cmd_export(
    ctx: &Context,
    layer: &str,
    output: &Path,
    at: Option<DateTime<Utc>>,
) -> Result<(), AppError> {
    let validated_output = validate_output_path(output)?;

    let session = ctx.open()?;
    let view = session.read()?;
    let layer = LayerId::new(layer)?;
    LayerModel::get_layer(view.reader(), &layer)?;
    let export = LayerExport::from_layer(view.reader(), &layer, threshold(at))?;
    let data = encode_export(&export)?;

    std::fs::write(&validated_output, &data)
        .map_err(|e| AppError::Io(format!("Write file: {}", e)))?;

    let digest = export_digest(&data);
    let output = serde_json::json!({
        "layer": layer,
        "path": validated_output,
        "bytes": data.len(),
        "attributes": export.attributes.len(),
        "relations": export.relations.len(),
        "digest": digest,
    });
    ctx.emit(&output, || {
        println!(
            "Exported {} attributes and {} relations of {} ({} bytes) to {:?}",
            export.attributes.len(),
            export.relations.len(),
            layer,
            data.len(),
            validated_output
        );
        println!("BLAKE3: {}", digest);
    })
}

/// Replace the content of a layer with an export file.
pub fn cmd_import(
    ctx: &Context,
    layer: &str,
    input: &Path,
    user: UserArg,
) -> Result<(), AppError> {
    let validated_path = validate_file_path(input)?;
    validate_file_size(&validated_path, MAX_IMPORT_FILE_SIZE)?;

    let data = std::fs::read(&validated_path)
        .map_err(|e| AppError::Io(format!("Read file: {}", e)))?;

    let target = LayerId::new(layer)?;
    let mut session = ctx.open()?;
    let mut uow = session.begin(ctx.config.user_or(user.user))?;
    LayerModel::create_layer_if_not_exists(&mut uow, &target, "imported")?;
    let outcome = import_layer(&mut uow, &target, &data)?;
    uow.commit()?;

    ctx.emit(&outcome, || {
        println!(
            "Imported into {}: attributes {} written, {} removed, {} unchanged; \
             relations {} written, {} removed, {} unchanged",
            target,
            outcome.attributes.written,
            outcome.attributes.removed,
            outcome.attributes.unchanged,
            outcome.relations.written,
            outcome.relations.removed,
            outcome.relations.unchanged
        );
    })
}

// =============================================================================
// COMPACT COMMAND
// =============================================================================

pub fn cmd_compact(ctx: &Context) -> Result<(), AppError> {
    let mut session = ctx.open()?;
    session.compact()?;
    if !ctx.json_mode {
        println!("Compacted {:?}", ctx.database);
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
