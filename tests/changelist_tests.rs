mod common;

use canopy::overlay::{DetachedBackend, LayerKind};
use canopy::CanopyError;
use common::Workspace;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_disjoint_shared_writes_are_visible_to_every_job() {
    let ws = Workspace::new(&[("shared/seed", "base")]);
    let changelist = ws.changelist("cl");
    let job_a = Arc::new(ws.stack("job-a", Some(Arc::clone(&changelist))));
    let job_b = Arc::new(ws.stack("job-b", Some(Arc::clone(&changelist))));

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [(Arc::clone(&job_a), "a"), (Arc::clone(&job_b), "b")]
        .into_iter()
        .map(|(stack, tag)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..20 {
                    let path = format!("shared/{}-{}.txt", tag, i);
                    stack
                        .write_shared(Path::new(&path), format!("{} {}", tag, i).as_bytes())
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for stack in [&job_a, &job_b] {
        for tag in ["a", "b"] {
            for i in 0..20 {
                let path = format!("shared/{}-{}.txt", tag, i);
                let hit = stack.resolve(Path::new(&path)).unwrap();
                assert_eq!(hit.top().map(|h| h.layer), Some(LayerKind::Changelist));
                assert_eq!(
                    stack.read_all(Path::new(&path)).unwrap(),
                    format!("{} {}", tag, i).as_bytes()
                );
            }
        }
        assert_eq!(stack.readdir(Path::new("shared")).unwrap().len(), 41);
    }
    assert!(!ws.base_root.join("shared/a-0.txt").exists());
}

#[test]
fn test_same_path_shared_writes_have_one_whole_winner() {
    let ws = Workspace::new(&[]);
    let changelist = ws.changelist("cl");
    let job_a = Arc::new(ws.stack("job-a", Some(Arc::clone(&changelist))));
    let job_b = Arc::new(ws.stack("job-b", Some(Arc::clone(&changelist))));

    let payload_a = vec![b'a'; 256 * 1024];
    let payload_b = vec![b'b'; 256 * 1024];

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [
        (Arc::clone(&job_a), payload_a.clone()),
        (Arc::clone(&job_b), payload_b.clone()),
    ]
    .into_iter()
    .map(|(stack, payload)| {
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..10 {
                stack.write_shared(Path::new("lock.json"), &payload).unwrap();
            }
        })
    })
    .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let seen_a = job_a.read_all(Path::new("lock.json")).unwrap();
    let seen_b = job_b.read_all(Path::new("lock.json")).unwrap();
    assert_eq!(seen_a, seen_b);
    assert!(seen_a == payload_a || seen_a == payload_b, "torn write");

    // Nothing left half-staged.
    let work = changelist.root().join("work");
    assert_eq!(std::fs::read_dir(work).unwrap().count(), 0);
}

#[test]
fn test_upper_shadows_changelist() {
    let ws = Workspace::new(&[("config", "base")]);
    let changelist = ws.changelist("cl");
    let job_a = ws.stack("job-a", Some(Arc::clone(&changelist)));
    let job_b = ws.stack("job-b", Some(Arc::clone(&changelist)));

    job_a.write_shared(Path::new("config"), b"shared").unwrap();
    job_b.write_all(Path::new("config"), b"private").unwrap();

    assert_eq!(job_a.read_all(Path::new("config")).unwrap(), b"shared");
    assert_eq!(job_b.read_all(Path::new("config")).unwrap(), b"private");
}

#[test]
fn test_shared_remove_hides_base_for_all_jobs() {
    let ws = Workspace::new(&[("obsolete.txt", "old")]);
    let changelist = ws.changelist("cl");
    let job_a = ws.stack("job-a", Some(Arc::clone(&changelist)));
    let job_b = ws.stack("job-b", Some(Arc::clone(&changelist)));

    job_a.remove_shared(Path::new("obsolete.txt")).unwrap();

    for stack in [&job_a, &job_b] {
        assert!(matches!(
            stack.lookup(Path::new("obsolete.txt")),
            Err(CanopyError::NotFound(_))
        ));
    }
    assert!(changelist.whiteouts().contains(Path::new("obsolete.txt")));
    assert!(ws.base_root.join("obsolete.txt").exists());
}

#[test]
fn test_shared_write_without_changelist_is_not_found() {
    let ws = Workspace::new(&[]);
    let stack = ws.stack("job-a", None);
    assert!(matches!(
        stack.write_shared(Path::new("x"), b"y"),
        Err(CanopyError::NotFound(_))
    ));
}

#[test]
fn test_registry_shares_one_changelist_and_never_deletes_it() {
    let ws = Workspace::new(&[]);
    let backend = DetachedBackend::new();
    let registry = ws.registry(&backend);

    let a = registry
        .mount("job-a", &ws.mount_path("a"), Arc::clone(&ws.base), Some("team"))
        .unwrap();
    registry
        .mount("job-b", &ws.mount_path("b"), Arc::clone(&ws.base), Some("team"))
        .unwrap();
    assert_eq!(registry.changelist_refs("team"), 2);

    let changelist = a.layers.changelist.clone().unwrap();
    assert_eq!(changelist.name, "team");
    assert_eq!(changelist.root, registry.settings().changelist_root.join("team"));

    registry
        .stack("job-a")
        .unwrap()
        .write_shared(Path::new("note"), b"from a")
        .unwrap();
    assert_eq!(
        registry
            .stack("job-b")
            .unwrap()
            .read_all(Path::new("note"))
            .unwrap(),
        b"from a"
    );

    registry.remove("job-a").unwrap();
    assert_eq!(registry.changelist_refs("team"), 1);
    registry.remove("job-b").unwrap();
    assert_eq!(registry.changelist_refs("team"), 0);

    assert!(changelist.root.join("tree/note").is_file());
}

#[test]
fn test_invalid_changelist_name_is_rejected() {
    let ws = Workspace::new(&[]);
    let registry = ws.registry(&DetachedBackend::new());
    assert!(matches!(
        registry.mount("job-a", &ws.mount_path("a"), Arc::clone(&ws.base), Some("../x")),
        Err(CanopyError::InvalidPath(_))
    ));
    assert!(registry.list().is_empty());
}
