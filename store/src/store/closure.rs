//! Export for stores without a native [Exporter] implementation:
//! resolve the requested objects, chase their reference closure, and
//! emit them in topological order.

use std::collections::BTreeSet;
use std::io::Write;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use crate::export;
use crate::store_path::StorePath;

use super::{BatchStore, ExportOptions, Object, Store, StoreError};

/// Exports `paths` (and, by default, their reference closure) from any
/// [Store], using up to `opts.max_concurrency` concurrent lookups.
/// Missing paths are an error.
pub async fn export_closure<S: Store + ?Sized>(
    store: &S,
    w: &mut (dyn Write + Send),
    paths: &[StorePath],
    opts: &ExportOptions,
) -> Result<(), StoreError> {
    let resolve = |batch: Vec<StorePath>| async move {
        stream::iter(batch)
            .map(|p| async move { store.object(&p).await })
            .buffered(opts.max_concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await
    };

    let mut objects = resolve(paths.to_vec()).await?;
    if opts.include_references {
        expand_closure(&mut objects, |batch| resolve(batch)).await?;
    }
    emit(w, objects).await
}

/// Like [export_closure], resolving objects through [BatchStore].
/// Since batch lookups silently omit missing objects, absence is
/// detected afterwards and reported as [StoreError::NotFound].
pub async fn export_closure_batch<S: BatchStore + ?Sized>(
    store: &S,
    w: &mut (dyn Write + Send),
    paths: &[StorePath],
    opts: &ExportOptions,
) -> Result<(), StoreError> {
    let resolve = |batch: Vec<StorePath>| async move {
        let objects = store.object_batch(&batch).await?;
        let found: BTreeSet<&StorePath> =
            objects.iter().map(|o| &o.trailer().store_path).collect();
        if let Some(missing) = batch.iter().find(|p| !found.contains(p)) {
            return Err(StoreError::NotFound(missing.clone()));
        }
        Ok(objects)
    };

    let mut objects = resolve(paths.to_vec()).await?;
    if opts.include_references {
        expand_closure(&mut objects, |batch| resolve(batch)).await?;
    }
    emit(w, objects).await
}

/// Repeatedly fetches unseen references of `objects` until the set is
/// closed.
async fn expand_closure<F, Fut>(
    objects: &mut Vec<Box<dyn Object>>,
    resolve: F,
) -> Result<(), StoreError>
where
    F: Fn(Vec<StorePath>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Box<dyn Object>>, StoreError>>,
{
    let mut seen: BTreeSet<StorePath> = objects
        .iter()
        .map(|o| o.trailer().store_path.clone())
        .collect();

    let mut frontier = 0;
    while frontier < objects.len() {
        let mut missing = Vec::new();
        for obj in &objects[frontier..] {
            let trailer = obj.trailer();
            for reference in &trailer.references {
                if *reference != trailer.store_path && seen.insert(reference.clone()) {
                    missing.push(reference.clone());
                }
            }
        }
        frontier = objects.len();

        if !missing.is_empty() {
            debug!(count = missing.len(), "fetching referenced objects");
            objects.extend(resolve(missing).await?);
        }
    }
    Ok(())
}

/// Emits objects such that each object's references (excluding itself)
/// are output before it. Each iteration selects the first unsorted
/// object whose outstanding references are all sorted; ties are broken
/// by iteration order.
async fn emit(
    w: &mut (dyn Write + Send),
    objects: Vec<Box<dyn Object>>,
) -> Result<(), StoreError> {
    let present: BTreeSet<StorePath> = objects
        .iter()
        .map(|o| o.trailer().store_path.clone())
        .collect();

    let mut remaining: Vec<Option<&Box<dyn Object>>> = objects.iter().map(Some).collect();
    let mut emitted: BTreeSet<&StorePath> = BTreeSet::new();
    let mut order = Vec::with_capacity(objects.len());

    while order.len() < objects.len() {
        let mut progressed = false;
        for slot in remaining.iter_mut() {
            let obj = match slot {
                Some(obj) => *obj,
                None => continue,
            };
            let trailer = obj.trailer();
            let ready = trailer.references.iter().all(|r| {
                *r == trailer.store_path || !present.contains(r) || emitted.contains(r)
            });
            if ready {
                emitted.insert(&trailer.store_path);
                order.push(obj);
                *slot = None;
                progressed = true;
                break;
            }
        }
        if !progressed {
            return Err(StoreError::Malformed(
                "reference cycle among exported objects".to_string(),
            ));
        }
    }

    let mut writer = export::Writer::new(w);
    for obj in order {
        writer.object()?;
        obj.write_nar(&mut writer).await?;
        writer.trailer(obj.trailer())?;
    }
    writer.finish()?;
    Ok(())
}
