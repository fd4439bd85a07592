use {
    common::runtime,
    filament::{FlsError, FlsKey, Handle, FLS_KEYS_MAX},
};

mod common;

#[test]
fn values_are_shared_by_every_fiber_of_a_runtime() {
    let rt = runtime(2);
    let key = rt
        .spawn(|| {
            let fls = Handle::current().unwrap();
            let key = fls.fls().create_key().unwrap();
            fls.fls().set(key, 0xfeed).unwrap();
            key
        })
        .unwrap()
        .join()
        .unwrap();

    let seen = rt
        .spawn(move || Handle::current().unwrap().fls().get(key))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(seen, 0xfeed);
    assert_eq!(rt.fls().get(key), 0xfeed);

    rt.fls().delete_key(key).unwrap();
    assert_eq!(rt.fls().get(key), 0);
}

#[test]
fn runtimes_do_not_share_keys() {
    let first = runtime(1);
    let second = runtime(1);
    let key = first.fls().create_key().unwrap();
    first.fls().set(key, 1).unwrap();
    assert_eq!(second.fls().get(key), 0);
    assert!(second.fls().is_empty());
}

#[test]
fn keys_run_out_after_the_maximum() {
    let rt = runtime(1);
    let keys = rt
        .spawn(|| {
            let handle = Handle::current().unwrap();
            let fls = handle.fls();
            let keys: Vec<FlsKey> = (0..FLS_KEYS_MAX)
                .map(|_| fls.create_key().unwrap())
                .collect();
            assert_eq!(fls.create_key(), Err(FlsError::Exhausted));
            keys
        })
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(keys.len(), FLS_KEYS_MAX);
    assert_eq!(rt.fls().len(), FLS_KEYS_MAX);

    rt.fls().delete_key(keys[17]).unwrap();
    assert_eq!(rt.fls().create_key(), Ok(keys[17]));
    assert_eq!(
        rt.fls().set(FlsKey::from(FLS_KEYS_MAX as u32), 1),
        Err(FlsError::InvalidKey(FLS_KEYS_MAX as u32))
    );
}

#[test]
fn shutdown_releases_every_key() {
    let rt = runtime(1);
    let handle = rt.handle().clone();
    let key = rt.fls().create_key().unwrap();
    rt.fls().set(key, 3).unwrap();
    assert_eq!(rt.shutdown(), 0);
    assert!(handle.fls().is_empty());
    assert_eq!(handle.fls().get(key), 0);
}
