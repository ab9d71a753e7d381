//! Resolving user-supplied layer lists, write targets and relation keys.
//!
//! Shared by the HTTP handlers and the CLI. Read sets and write layers must
//! name registered layers.

use layerkeeper_core::{
    LayerId, LayerModel, LayerSet, PredicateId, RecordReader, RelationKey, StoreError,
};

/// Split a comma-separated id list, dropping blanks.
pub fn split_ids(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn layer_ids(ids: &[String]) -> Result<Vec<LayerId>, StoreError> {
    ids.iter().map(LayerId::new).collect()
}

/// A read set of registered layers, most precedent first.
pub fn read_set(reader: &dyn RecordReader, list: &str) -> Result<LayerSet, StoreError> {
    LayerModel::build_layer_set(reader, &layer_ids(&split_ids(list))?)
}

/// The write layer and the read set its policy looks at.
///
/// The write layer must be registered and part of the read set; an empty
/// read set means the write layer alone.
pub fn write_target(
    reader: &dyn RecordReader,
    layer: &str,
    read_layers: &[String],
) -> Result<(LayerId, LayerSet), StoreError> {
    let layer = LayerId::new(layer)?;
    LayerModel::get_layer(reader, &layer)?;
    if read_layers.is_empty() {
        return Ok((layer.clone(), LayerSet::single(layer)));
    }
    let set = LayerModel::build_layer_set(reader, &layer_ids(read_layers)?)?;
    if !set.contains(&layer) {
        return Err(StoreError::InvalidState(format!(
            "Write layer {} is not part of {}",
            layer, set
        )));
    }
    Ok((layer, set))
}

pub fn relation_key(from: &str, to: &str, predicate: &str) -> Result<RelationKey, StoreError> {
    Ok(RelationKey::new(
        from.parse()?,
        to.parse()?,
        PredicateId::new(predicate)?,
    ))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use layerkeeper_core::{Session, UserId};

    fn session_with(layers: &[&str]) -> Session {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("test")).unwrap();
        for id in layers {
            LayerModel::create_layer_if_not_exists(&mut uow, &LayerId::new(*id).unwrap(), "")
                .unwrap();
        }
        uow.commit().unwrap();
        session
    }

    #[test]
    fn split_drops_blanks() {
        assert_eq!(split_ids(" a, ,b,"), vec!["a".to_string(), "b".to_string()]);
        assert!(split_ids("").is_empty());
    }

    #[test]
    fn read_set_requires_registered_layers() {
        let session = session_with(&["base", "override"]);
        let view = session.read().unwrap();
        let set = read_set(view.reader(), "override,base").unwrap();
        assert_eq!(set.len(), 2);
        assert!(matches!(
            read_set(view.reader(), "override,ghost"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn write_layer_must_be_in_read_set() {
        let session = session_with(&["base", "override"]);
        let view = session.read().unwrap();

        let (layer, set) = write_target(view.reader(), "base", &[]).unwrap();
        assert_eq!(layer.as_str(), "base");
        assert_eq!(set.len(), 1);

        let result = write_target(view.reader(), "base", &["override".to_string()]);
        assert!(matches!(result, Err(StoreError::InvalidState(_))));
    }

    #[test]
    fn relation_key_validates_parts() {
        assert!(relation_key("nope", "nope", "owns").is_err());
    }
}
