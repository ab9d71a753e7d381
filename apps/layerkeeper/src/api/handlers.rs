//! # API Endpoint Handlers
//!
//! Every handler takes the session lock, then runs one synchronous
//! operation: a read snapshot for queries, a single unit of work for writes.
//! A unit of work is committed only when the whole operation succeeded.

use super::{
    AppState,
    error::ApiError,
    types::{
        ChangesetParams, CiResponse, CreateCiRequest, CreateLayerRequest, DeleteLayerResponse,
        EffectiveTraitsResponse, ExportRequest, ExportResponse, HealthResponse, LayerResponse,
        PredicateRequest, PredicateWriteResponse, ReadParams, RemoveAttributeRequest,
        RemoveRelationRequest, SetAttributeRequest, SetRelationRequest, TraitListResponse,
        WriteResponse,
    },
};
use crate::config::AppConfig;
use crate::target::{read_set, relation_key, write_target};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use layerkeeper_core::{
    Changeset, CiId, CiModel, CiSelection, EffectiveTrait, EffectiveTraitEngine, Layer, LayerId,
    LayerModel, LayerStatistics, LayeredWriter, MergeEngine, MergedCi, MergedRelation, Predicate,
    PredicateId, PredicateModel, RelationSelection, Session, StoreError, TimeThreshold, TraitId,
    changeset::ChangesetModel,
    export::{LayerExport, encode_export, export_digest},
};

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// LAYER HANDLERS
// =============================================================================

pub async fn list_layers_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Layer>>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    Ok(Json(LayerModel::all_layers(view.reader())?))
}

pub async fn create_layer_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateLayerRequest>,
) -> Result<Json<LayerResponse>, ApiError> {
    let mut session = state.session.write().await;
    Ok(Json(create_layer(&mut session, &state.config, request)?))
}

fn create_layer(
    session: &mut Session,
    config: &AppConfig,
    request: CreateLayerRequest,
) -> Result<LayerResponse, StoreError> {
    let id = LayerId::new(request.id)?;
    let mut uow = session.begin(config.user_or(request.user))?;
    let (layer, created) =
        LayerModel::create_layer_if_not_exists(&mut uow, &id, &request.description)?;
    uow.commit()?;
    Ok(LayerResponse { layer, created })
}

pub async fn layer_stats_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LayerStatistics>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    Ok(Json(LayerModel::statistics(view.reader(), &LayerId::new(id)?)?))
}

/// Delete an empty layer; `deleted: false` when it still holds records.
pub async fn delete_layer_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteLayerResponse>, ApiError> {
    let mut session = state.session.write().await;
    let deleted = delete_layer(&mut session, &state.config, &id)?;
    Ok(Json(DeleteLayerResponse { deleted }))
}

fn delete_layer(session: &mut Session, config: &AppConfig, id: &str) -> Result<bool, StoreError> {
    let id = LayerId::new(id)?;
    let mut uow = session.begin(config.user_id())?;
    let deleted = LayerModel::try_delete_layer(&mut uow, &id)?;
    uow.commit()?;
    Ok(deleted)
}

// =============================================================================
// CI HANDLERS
// =============================================================================

pub async fn create_ci_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateCiRequest>,
) -> Result<Json<CiResponse>, ApiError> {
    let mut session = state.session.write().await;
    Ok(Json(create_ci(&mut session, &state.config, request)?))
}

fn create_ci(
    session: &mut Session,
    config: &AppConfig,
    request: CreateCiRequest,
) -> Result<CiResponse, StoreError> {
    let id = request.id.as_deref().map(str::parse::<CiId>).transpose()?;
    let mut uow = session.begin(config.user_or(request.user))?;
    let id = CiModel::create_ci(&mut uow, id)?;
    uow.commit()?;
    Ok(CiResponse { id })
}

/// Merged view of every CI.
pub async fn list_cis_handler(
    State(state): State<AppState>,
    Query(params): Query<ReadParams>,
) -> Result<Json<Vec<MergedCi>>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    let layers = read_set(view.reader(), &params.layers)?;
    Ok(Json(MergeEngine::get_merged_cis(
        view.reader(),
        &CiSelection::All,
        &layers,
        params.threshold(),
    )?))
}

pub async fn get_ci_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReadParams>,
) -> Result<Json<MergedCi>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    let ci: CiId = id.parse()?;
    if !CiModel::ci_exists_at(view.reader(), ci, params.threshold())? {
        return Err(StoreError::NotFound(format!("CI {}", ci)).into());
    }
    let layers = read_set(view.reader(), &params.layers)?;
    Ok(Json(MergeEngine::get_merged_ci(
        view.reader(),
        ci,
        &layers,
        params.threshold(),
    )?))
}

/// Merged relations with the CI at either end.
pub async fn ci_relations_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReadParams>,
) -> Result<Json<Vec<MergedRelation>>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    let ci: CiId = id.parse()?;
    let layers = read_set(view.reader(), &params.layers)?;
    Ok(Json(MergeEngine::get_merged_relations_with(
        view.reader(),
        &RelationSelection::either([ci]),
        &layers,
        params.threshold(),
        params.masks,
    )?))
}

/// Every active trait the CI has.
pub async fn ci_traits_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReadParams>,
) -> Result<Json<Vec<EffectiveTrait>>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    let ci: CiId = id.parse()?;
    let layers = read_set(view.reader(), &params.layers)?;
    let meta = state.config.meta_configuration()?;
    let traits = view.active_traits(&meta.layers)?;
    let effective = EffectiveTraitEngine::effective_traits_of_ci(
        view.reader(),
        ci,
        traits.iter(),
        &layers,
        params.threshold(),
    )?;
    Ok(Json(effective.into_values().collect()))
}

// =============================================================================
// ATTRIBUTE HANDLERS
// =============================================================================

pub async fn set_attribute_handler(
    State(state): State<AppState>,
    Json(request): Json<SetAttributeRequest>,
) -> Result<Json<WriteResponse>, ApiError> {
    let mut session = state.session.write().await;
    Ok(Json(set_attribute(&mut session, &state.config, request)?))
}

fn set_attribute(
    session: &mut Session,
    config: &AppConfig,
    request: SetAttributeRequest,
) -> Result<WriteResponse, StoreError> {
    let ci: CiId = request.ci.parse()?;
    let value = request.value.to_value()?;
    let mut uow = session.begin(config.user_or(request.user))?;
    let (layer, read_layers) = write_target(uow.reader(), &request.layer, &request.read_layers)?;
    let outcome = LayeredWriter::insert_attribute(
        &mut uow,
        ci,
        &request.name,
        value,
        &layer,
        &read_layers,
        request.policy,
    )?;
    uow.commit()?;
    Ok(outcome.into())
}

pub async fn remove_attribute_handler(
    State(state): State<AppState>,
    Json(request): Json<RemoveAttributeRequest>,
) -> Result<Json<WriteResponse>, ApiError> {
    let mut session = state.session.write().await;
    Ok(Json(remove_attribute(&mut session, &state.config, request)?))
}

fn remove_attribute(
    session: &mut Session,
    config: &AppConfig,
    request: RemoveAttributeRequest,
) -> Result<WriteResponse, StoreError> {
    let ci: CiId = request.ci.parse()?;
    let mut uow = session.begin(config.user_or(request.user))?;
    let (layer, read_layers) = write_target(uow.reader(), &request.layer, &request.read_layers)?;
    let outcome = LayeredWriter::remove_attribute(
        &mut uow,
        ci,
        &request.name,
        &layer,
        &read_layers,
        request.mask,
    )?;
    uow.commit()?;
    Ok(outcome.into())
}

// =============================================================================
// RELATION HANDLERS
// =============================================================================

pub async fn set_relation_handler(
    State(state): State<AppState>,
    Json(request): Json<SetRelationRequest>,
) -> Result<Json<WriteResponse>, ApiError> {
    let mut session = state.session.write().await;
    Ok(Json(set_relation(&mut session, &state.config, request)?))
}

fn set_relation(
    session: &mut Session,
    config: &AppConfig,
    request: SetRelationRequest,
) -> Result<WriteResponse, ApiError> {
    let key = relation_key(&request.from, &request.to, &request.predicate)?;
    let meta = if request.checked {
        Some(config.meta_configuration()?)
    } else {
        None
    };
    let mut uow = session.begin(config.user_or(request.user))?;
    let (layer, read_layers) = write_target(uow.reader(), &request.layer, &request.read_layers)?;
    if let Some(meta) = meta {
        PredicateModel::ensure_predicate_known(uow.reader(), &key.predicate, &meta.layers)?;
    }
    let outcome =
        LayeredWriter::insert_relation(&mut uow, &key, &layer, &read_layers, request.policy)?;
    uow.commit()?;
    Ok(outcome.into())
}

pub async fn remove_relation_handler(
    State(state): State<AppState>,
    Json(request): Json<RemoveRelationRequest>,
) -> Result<Json<WriteResponse>, ApiError> {
    let mut session = state.session.write().await;
    Ok(Json(remove_relation(&mut session, &state.config, request)?))
}

fn remove_relation(
    session: &mut Session,
    config: &AppConfig,
    request: RemoveRelationRequest,
) -> Result<WriteResponse, StoreError> {
    let key = relation_key(&request.from, &request.to, &request.predicate)?;
    let mut uow = session.begin(config.user_or(request.user))?;
    let (layer, read_layers) = write_target(uow.reader(), &request.layer, &request.read_layers)?;
    let outcome =
        LayeredWriter::remove_relation(&mut uow, &key, &layer, &read_layers, request.mask)?;
    uow.commit()?;
    Ok(outcome.into())
}

// =============================================================================
// TRAIT HANDLERS
// =============================================================================

/// Active traits of the configured meta layers, with conflicts and errors.
pub async fn list_traits_handler(
    State(state): State<AppState>,
) -> Result<Json<TraitListResponse>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    let meta = state.config.meta_configuration()?;
    let active = view.active_traits(&meta.layers)?;
    Ok(Json(TraitListResponse {
        traits: active.traits.into_values().collect(),
        conflicts: active.conflicts,
        errors: active
            .errors
            .into_iter()
            .map(|(id, e)| (id.to_string(), e.to_string()))
            .collect(),
    }))
}

/// Every CI having the trait.
pub async fn effective_traits_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReadParams>,
) -> Result<Json<EffectiveTraitsResponse>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    let trait_id = TraitId::new(id)?;
    let layers = read_set(view.reader(), &params.layers)?;
    let meta = state.config.meta_configuration()?;
    let active = view.active_traits(&meta.layers)?;
    let effective = EffectiveTraitEngine::get_effective_traits_for_trait(
        view.reader(),
        active.require(&trait_id)?,
        &CiSelection::All,
        &layers,
        params.threshold(),
    )?;
    Ok(Json(EffectiveTraitsResponse {
        trait_id: trait_id.to_string(),
        effective: effective.into_values().collect(),
    }))
}

// =============================================================================
// PREDICATE HANDLERS
// =============================================================================

pub async fn list_predicates_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Predicate>>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    let meta = state.config.meta_configuration()?;
    Ok(Json(PredicateModel::get_all(
        view.reader(),
        &meta.layers,
        TimeThreshold::Latest,
    )?))
}

pub async fn upsert_predicate_handler(
    State(state): State<AppState>,
    Json(request): Json<PredicateRequest>,
) -> Result<Json<PredicateWriteResponse>, ApiError> {
    let mut session = state.session.write().await;
    let meta = state.config.meta_configuration()?;
    let id = PredicateId::new(request.id)?;
    let mut uow = session.begin(state.config.user_or(request.user))?;
    LayerModel::create_layer_if_not_exists(&mut uow, &meta.write_layer, "configuration records")?;
    let write = PredicateModel::insert_or_update(
        &mut uow,
        &meta,
        id,
        request.wording_from,
        request.wording_to,
    )?;
    uow.commit()?;
    Ok(Json(PredicateWriteResponse {
        ci: write.stored.ci,
        changed: write.changed,
    }))
}

// =============================================================================
// CHANGESET HANDLER
// =============================================================================

/// Changesets in a timespan, newest first.
pub async fn changesets_handler(
    State(state): State<AppState>,
    Query(params): Query<ChangesetParams>,
) -> Result<Json<Vec<Changeset>>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    let layers = read_set(view.reader(), &params.layers)?;
    let cis = match &params.ci {
        Some(ci) => CiSelection::specific([ci.parse::<CiId>()?]),
        None => CiSelection::All,
    };
    Ok(Json(ChangesetModel::changesets_in_timespan(
        view.reader(),
        params.from.unwrap_or(DateTime::<Utc>::MIN_UTC),
        params.to.unwrap_or_else(Utc::now),
        &layers,
        &cis,
        params.limit,
    )?))
}

// =============================================================================
// EXPORT HANDLER
// =============================================================================

/// Export the live content of one layer.
pub async fn export_handler(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Result<Json<ExportResponse>, ApiError> {
    let session = state.session.read().await;
    let view = session.read()?;
    let layer = LayerId::new(request.layer)?;
    LayerModel::get_layer(view.reader(), &layer)?;
    let at = request.at.map_or(TimeThreshold::Latest, TimeThreshold::AsOf);
    let export = LayerExport::from_layer(view.reader(), &layer, at)?;
    let data = encode_export(&export)?;
    tracing::info!(layer = %layer, bytes = data.len(), "exported layer");
    Ok(Json(ExportResponse::new(
        &data,
        export_digest(&data),
        export.attributes.len(),
        export.relations.len(),
    )))
}
