//! Integration tests for psetkv

use psetkv::kvs::{
    parse_set_file, KvStore, NotificationListener, NullNotifier, SocketNotifier, UPDATE_CODE,
};
use psetkv::{Config, Error, GroupId};
use std::io::Write;
use std::sync::mpsc;
use std::thread;
use tempfile::TempDir;

fn unique_group(prefix: &str) -> GroupId {
    GroupId::new(format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())).unwrap()
}

#[test]
fn test_lifecycle_with_set_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sets.txt");
    std::fs::write(&path, "# coupled model\nocean 0 3\natmosphere 4-7\nice,8,8\n").unwrap();
    let sets = parse_set_file(&path).unwrap();
    assert_eq!(sets.len(), 3);

    let group = unique_group("it-life");
    let mut root = KvStore::initialize(group.clone(), 0, 9, &sets, NullNotifier).unwrap();
    let mut rank5 = KvStore::attach(group.clone(), 5, NullNotifier).unwrap();

    assert_eq!(root.global_set_count(), 5);
    assert_eq!(rank5.get("app://atmosphere").unwrap().ranks, vec![4, 5, 6, 7]);
    assert_eq!(rank5.get("app://ice").unwrap().ranks, vec![8]);
    assert_eq!(rank5.get("mpi://WORLD").unwrap().len(), 9);

    // rank 5 moves from atmosphere to ocean
    rank5.del("app://atmosphere", 1).unwrap();
    rank5.add("app://ocean", 5).unwrap();

    assert_eq!(root.get("app://atmosphere").unwrap().ranks, vec![4, 6, 7]);
    let ocean = root.get("app://ocean").unwrap();
    assert_eq!(ocean.ranks, vec![0, 1, 2, 3, 5]);
    assert_eq!(ocean.version, 2);

    let mut local = rank5.local_set_names().unwrap();
    local.sort();
    assert_eq!(local, vec!["app://ocean", "mpi://SELF", "mpi://WORLD"]);

    let snapshot = root.snapshot().unwrap();
    assert_eq!(snapshot.len(), 4);
    assert!(snapshot.iter().all(|e| !e.key.is_empty()));

    rank5.detach();
    root.destroy().unwrap();
    assert!(KvStore::attach(group, 1, NullNotifier).is_err());
}

#[test]
fn test_config_file_drives_initialization() {
    let dir = TempDir::new().unwrap();
    let set_file = dir.path().join("extra.sets");
    std::fs::write(&set_file, "land 2 3\n").unwrap();

    let group = unique_group("it-config");
    let config_path = dir.path().join("psetkv.toml");
    let mut file = std::fs::File::create(&config_path).unwrap();
    writeln!(
        file,
        r#"
group = "{}"
rank = 0
world_size = 4
set_file = "{}"

[[sets]]
name = "ocean"
lower = 0
upper = 1
"#,
        group,
        set_file.display()
    )
    .unwrap();

    let config = Config::load(Some(config_path.as_path())).unwrap();
    let sets = config.set_definitions().unwrap();
    let mut store = KvStore::initialize(
        config.group_id().unwrap(),
        config.rank,
        config.world_size,
        &sets,
        NullNotifier,
    )
    .unwrap();

    assert_eq!(store.get("app://ocean").unwrap().ranks, vec![0, 1]);
    assert_eq!(store.get("app://land").unwrap().ranks, vec![2, 3]);
    assert_eq!(store.get("mpi://WORLD").unwrap().ranks, vec![0, 1, 2, 3]);
    store.destroy().unwrap();
}

#[test]
fn test_watch_over_sockets() {
    let dir = TempDir::new().unwrap();
    let notify_dir = dir.path().to_path_buf();
    let group = unique_group("it-watch");
    let sets = vec![psetkv::SetDefinition::new("ocean", 0, 1)];

    let notifier = SocketNotifier::new(&notify_dir).unwrap();
    let mut writer = KvStore::initialize(group.clone(), 0, 4, &sets, notifier).unwrap();

    let (ready_tx, ready_rx) = mpsc::channel();
    let watcher = {
        let group = group.clone();
        let notify_dir = notify_dir.clone();
        thread::spawn(move || {
            let mut listener = NotificationListener::bind(&notify_dir, 3).unwrap();
            let mut store = KvStore::attach(group, 3, NullNotifier).unwrap();
            let slot = store.get("app://ocean").unwrap().slot.unwrap();
            store.subscribe(slot).unwrap();
            ready_tx.send(slot).unwrap();

            let notification = listener.wait_for(slot).unwrap();
            let seen = store.get("app://ocean").unwrap();
            (notification, seen)
        })
    };

    let slot = ready_rx.recv().unwrap();
    writer.put("app://ocean", &[0, 1, 3]).unwrap();

    let (notification, seen) = watcher.join().unwrap();
    assert_eq!(notification.slot as usize, slot);
    assert_eq!(notification.code, UPDATE_CODE);
    assert_eq!(seen.ranks, vec![0, 1, 3]);
    assert_eq!(seen.version, 2);

    // the watcher list was drained: nobody is listening on rank 3 any more
    writer.put("app://ocean", &[0]).unwrap();
    writer.destroy().unwrap();
}

#[test]
fn test_failed_notification_keeps_watchers() {
    let dir = TempDir::new().unwrap();
    let group = unique_group("it-nolistener");

    let notifier = SocketNotifier::new(dir.path()).unwrap();
    let mut writer = KvStore::initialize(group.clone(), 0, 2, &[], notifier).unwrap();
    let mut other = KvStore::attach(group, 1, NullNotifier).unwrap();

    let slot = other.get("mpi://WORLD").unwrap().slot.unwrap();
    other.subscribe(slot).unwrap();

    // rank 1 never bound a socket
    let err = writer.put("mpi://WORLD", &[0, 1, 2]).unwrap_err();
    assert!(matches!(err, Error::Notify { rank: 1, .. }));

    // the lock was released and the pending watcher is still recorded
    let snapshot = writer.snapshot().unwrap();
    assert_eq!(snapshot[slot].pending, vec![1]);
    assert_eq!(snapshot[slot].ranks, vec![0, 1, 2]);

    let listener = NotificationListener::bind(dir.path(), 1).unwrap();
    writer.put("mpi://WORLD", &[0, 1]).unwrap();
    assert!(writer.snapshot().unwrap()[slot].pending.is_empty());
    drop(listener);

    other.detach();
    writer.destroy().unwrap();
}

#[test]
fn test_growth_across_handles() {
    let group = unique_group("it-grow");
    let mut a = KvStore::initialize(group.clone(), 0, 2, &[], NullNotifier).unwrap();
    let mut b = KvStore::attach(group, 1, NullNotifier).unwrap();

    a.add_to_world(2000).unwrap();
    let world = b.get("mpi://WORLD").unwrap();
    assert_eq!(world.len(), 2002);
    assert_eq!(world.ranks[2001], 2001);

    let slot = world.slot.unwrap();
    assert_eq!(b.shadow(slot), a.shadow(slot));
    assert_eq!(b.shadow(slot).unwrap().ranks, 2002);

    b.detach();
    a.destroy().unwrap();
}
