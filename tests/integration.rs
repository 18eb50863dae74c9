//! Whole-system scenario against the public API

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tierdb::{
    Collection, CollectionHandle, FieldRef, IndexedField, MemoryBackend, Outcome, Record,
    RecordMeta, Registry, RejectedUpdate, RequiredCell, SerialExecutor, SetCell,
};
use uuid::Uuid;

#[derive(Clone, Default, Serialize, Deserialize)]
struct Player {
    #[serde(flatten)]
    meta: RecordMeta<Uuid>,
    username: RequiredCell<String>,
    coins: RequiredCell<i64>,
    badges: SetCell<String>,
}

impl Record for Player {
    type Key = Uuid;
    fn meta(&self) -> &RecordMeta<Uuid> {
        &self.meta
    }
    fn custom_fields(&self) -> Vec<FieldRef<'_>> {
        vec![
            FieldRef::new("username", &self.username),
            FieldRef::new("coins", &self.coins),
            FieldRef::new("badges", &self.badges),
        ]
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct Guild {
    #[serde(flatten)]
    meta: RecordMeta<String>,
    motto: RequiredCell<String>,
}

impl Record for Guild {
    type Key = String;
    fn meta(&self) -> &RecordMeta<String> {
        &self.meta
    }
    fn custom_fields(&self) -> Vec<FieldRef<'_>> {
        vec![FieldRef::new("motto", &self.motto)]
    }
}

#[test]
fn test_full_lifecycle_scenario() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let backend = Arc::new(MemoryBackend::new());

    let players: Arc<Collection<Player>> =
        Collection::builder("players", Arc::clone(&backend) as _).build();
    let guilds: Arc<Collection<Guild>> = Collection::builder("guilds", Arc::clone(&backend) as _)
        .dependency("players")
        .build();

    let registry = Registry::new();
    registry.register(Arc::clone(&players) as _).unwrap();
    registry.register(Arc::clone(&guilds) as _).unwrap();

    let scheduler = registry.scheduler().unwrap();
    scheduler.start_all(None).unwrap();

    let username_index: IndexedField<Player> =
        IndexedField::new("username", |p: &Player| p.username.get());
    players.register_index(&username_index).unwrap();

    // Create and look up by index
    let alice_key = Uuid::new_v4();
    let alice = players
        .create_sync(alice_key, |p| {
            p.username.set("alice01".to_string())?;
            p.coins.set(100)?;
            Ok(())
        })
        .success()
        .unwrap();

    let by_name = players
        .read_by_index_sync(&username_index, &"alice01")
        .success()
        .unwrap();
    assert!(Arc::ptr_eq(&alice, &by_name));

    // Concurrent spending against one wallet never loses an update
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let players = Arc::clone(&players);
            let key = alice_key;
            scope.spawn(move || {
                for _ in 0..5 {
                    let outcome = players.update_sync(&key, |p| {
                        let coins = p.coins.get().unwrap();
                        if coins < 5 {
                            return Err(RejectedUpdate::new("broke"));
                        }
                        p.coins.set(coins - 5).ok();
                        Ok(())
                    });
                    assert!(outcome.is_success());
                }
            });
        }
    });
    assert_eq!(alice.coins.get().unwrap(), 0);
    assert_eq!(alice.version().unwrap(), 20);

    // A rejected update leaves the record untouched
    let outcome = players.update_sync(&alice_key, |p| {
        let coins = p.coins.get().unwrap();
        if coins < 5 {
            return Err(RejectedUpdate::new("broke"));
        }
        p.coins.set(coins - 5).ok();
        Ok(())
    });
    assert!(outcome.is_rejected());
    assert_eq!(alice.version().unwrap(), 20);

    // Container field mutation through an update
    players
        .update_sync(&alice_key, |p| {
            p.badges.insert("frugal".to_string()).ok();
            Ok(())
        })
        .success()
        .unwrap();
    assert!(alice.badges.contains(&"frugal".to_string()).unwrap());

    // Continuations marshalled onto the serial context run with the result
    let serial = SerialExecutor::new();
    let (tx, rx) = std::sync::mpsc::channel();
    Arc::clone(&players)
        .read(&alice_key)
        .then_serial(&serial, move |outcome: Outcome<Arc<Player>>| {
            let coins = outcome.success().unwrap().coins.get().unwrap();
            tx.send(coins).unwrap();
        });
    assert_eq!(rx.recv().unwrap(), 0);

    // Admin inspection
    let info = registry.describe(10);
    assert_eq!(info.len(), 2);
    assert!(info.iter().all(|i| i.running));

    // Dependency-ordered shutdown leaves everything stopped and evicted
    scheduler.shutdown_all(None).unwrap();
    assert!(!players.is_running());
    assert!(!guilds.is_running());
    assert!(!alice.is_valid());

    // Durable data survives shutdown
    scheduler.start_all(None).unwrap();
    let reloaded = players.read_sync(&alice_key).success().unwrap();
    assert!(!Arc::ptr_eq(&alice, &reloaded));
    assert_eq!(reloaded.coins.get().unwrap(), 0);
    assert_eq!(reloaded.version().unwrap(), 21);
}
