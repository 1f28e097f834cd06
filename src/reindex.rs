use std::collections::BTreeMap;
use std::fs;

use crate::context::Scanarium;
use crate::error::Result;

/// Rebuild the listing the front end reads for one scene: per actor the
/// scanned PNG basenames, newest first. Half-written `tmp-` files are
/// never listed.
pub fn reindex_actors_for_scene(scanarium: &Scanarium, scene: &str) -> Result<()> {
    let scene_dir = scanarium.dynamic_dir_abs()?.join("scenes").join(scene);
    let actors_dir = scene_dir.join("actors");

    let mut listing: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Ok(actors) = fs::read_dir(&actors_dir) {
        for actor in actors.filter_map(|entry| entry.ok()) {
            if !actor.path().is_dir() {
                continue;
            }
            let Some(actor_name) = actor.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let mut files: Vec<String> = fs::read_dir(actor.path())
                .map(|entries| {
                    entries
                        .filter_map(|entry| entry.ok())
                        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                        .filter(|name| name.ends_with(".png") && !name.starts_with("tmp-"))
                        .collect()
                })
                .unwrap_or_default();
            files.sort_by(|a, b| b.cmp(a));
            listing.insert(actor_name, files);
        }
    }

    scanarium.dump_json(&scene_dir.join("actors-latest.json"), &listing)
}

/// One-shot reindex of every scene.
pub fn reindex(scanarium: &Scanarium) -> Result<()> {
    let scenes_dir = scanarium.scenes_dir_abs()?;
    let dynamic_scenes_dir = scanarium.dynamic_dir_abs()?.join("scenes");
    let Ok(scenes) = fs::read_dir(&scenes_dir) else {
        return Ok(());
    };
    let mut names: Vec<String> = scenes
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    for scene in names {
        log::debug!("reindexing scene {scene:?} ...");
        let _ = fs::create_dir_all(dynamic_scenes_dir.join(&scene));
        reindex_actors_for_scene(scanarium, &scene)?;
    }
    Ok(())
}
