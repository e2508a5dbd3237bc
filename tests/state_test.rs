use std::path::PathBuf;
use std::rc::Rc;
use tnn::ops::{BatchNormConfig, bn, proj};
use tnn::*;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tnn_{}_{name}.bin", std::process::id()))
}

#[test]
fn get_or_create_is_idempotent_per_scope() {
    let mut state = State::with_seed(0);
    let init = Init::Normal { std: 0.1 };

    let (a, created_a) = state.scoped("x", |s| s.get_or_create("w", &[2, 2], Kind::Parameter, init));
    let (a2, created_a2) =
        state.scoped("x", |s| s.get_or_create("w", &[2, 2], Kind::Parameter, init));
    let (b, created_b) = state.scoped("y", |s| s.get_or_create("w", &[2, 2], Kind::Parameter, init));

    assert!(created_a && !created_a2 && created_b);
    assert!(Rc::ptr_eq(&a, &a2));
    assert!(!Rc::ptr_eq(&a, &b));
    assert_ne!(a.values(), b.values());
}

#[test]
fn seeded_states_initialize_identically() {
    let build = || {
        let mut state = State::with_seed(99);
        let x = RawTensor::input(vec![1.0; 4], &[1, 4]);
        proj(&mut state, &x, 3);
        state.get("proj").unwrap().values()
    };
    assert_eq!(build(), build());
}

#[test]
fn scope_filtering_respects_segment_boundaries() {
    let mut state = State::with_seed(0);
    for key in ["a/b", "a/b/c", "a/bc", "z"] {
        state.get_or_create(key, &[1], Kind::Parameter, Init::Zeros);
    }
    let keys: Vec<String> = state.enumerate("a/b").into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["a/b".to_string(), "a/b/c".to_string()]);

    let inside = state.push("a");
    let keys: Vec<String> = inside.enumerate("b").into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["b".to_string(), "b/c".to_string()]);
    assert_eq!(inside.keys().len(), 3);
}

#[test]
fn save_load_round_trip_is_bit_exact() {
    let path = temp_path("round_trip");
    let values: Vec<f32> = (0..12).map(|i| (i as f32 * 0.7).sin() / 3.0).collect();

    let mut src = State::with_seed(0);
    src.set("w", RawTensor::parameter(values.clone(), &[3, 4]));
    assert_eq!(src.save(&path).unwrap(), 1);

    let mut dst = State::with_seed(1);
    assert_eq!(dst.load(&path).unwrap(), 1);
    let w = dst.get("w").unwrap();
    assert_eq!(w.shape(), vec![3, 4]);
    assert_eq!(w.kind(), Kind::Unclaimed);
    let bits: Vec<u32> = w.values().iter().map(|v| v.to_bits()).collect();
    let expected: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
    assert_eq!(bits, expected);

    std::fs::remove_file(&path).ok();
}

#[test]
fn file_layout_matches_record_format() {
    let path = temp_path("layout");
    let mut state = State::with_seed(0);
    state.set("net/b", RawTensor::parameter(vec![0.25], &[]));
    state.set("net/w", RawTensor::parameter(vec![1.0, 2.0], &[1, 2]));
    state.set("other", RawTensor::parameter(vec![9.0], &[1]));

    state.push("net").save(&path).unwrap();
    let bytes = std::fs::read(&path).unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.extend_from_slice(b"b");
    expected.extend_from_slice(&0u32.to_le_bytes());
    expected.extend_from_slice(&0.25f32.to_le_bytes());
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.extend_from_slice(b"w");
    expected.extend_from_slice(&2u32.to_le_bytes());
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.extend_from_slice(&2u32.to_le_bytes());
    expected.extend_from_slice(&1.0f32.to_le_bytes());
    expected.extend_from_slice(&2.0f32.to_le_bytes());
    assert_eq!(bytes, expected);

    std::fs::remove_file(&path).ok();
}

#[test]
fn load_reroots_under_active_scope_and_replaces() {
    let path = temp_path("reroot");
    let mut src = State::with_seed(0);
    src.set("w", RawTensor::parameter(vec![5.0], &[1]));
    src.save(&path).unwrap();

    let mut dst = State::with_seed(0);
    let (old, _) = dst.get_or_create("copy/w", &[1], Kind::Parameter, Init::Zeros);
    dst.push("copy").load(&path).unwrap();

    let new = dst.get("copy/w").unwrap();
    assert!(!Rc::ptr_eq(&old, &new));
    assert_eq!(new.item(), 5.0);
    assert_eq!(dst.len(), 1);

    std::fs::remove_file(&path).ok();
}

#[test]
fn truncated_file_loads_complete_prefix() {
    let path = temp_path("truncated");
    let mut state = State::with_seed(0);
    state.set("a", RawTensor::parameter(vec![1.0, 2.0], &[2]));
    state.set("b", RawTensor::parameter(vec![3.0; 8], &[2, 4]));
    state.save(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

    let mut loaded = State::with_seed(0);
    assert_eq!(loaded.load(&path).unwrap(), 1);
    assert_eq!(loaded.keys(), vec!["a".to_string()]);

    std::fs::remove_file(&path).ok();
}

#[test]
fn missing_file_is_an_io_error() {
    let mut state = State::with_seed(0);
    let err = state.load(temp_path("does_not_exist")).unwrap_err();
    assert!(matches!(err, TnnError::Io(_)));
}

#[test]
fn loaded_tensors_are_claimed_by_operators() {
    let path = temp_path("claim");
    let x = RawTensor::input(vec![1.0, 2.0, 3.0], &[1, 3]);

    let mut trained = State::with_seed(1);
    let y_trained = trained.scoped("layer", |s| proj(s, &x, 2)).values();
    trained.save(&path).unwrap();

    let mut fresh = State::with_seed(2);
    fresh.load(&path).unwrap();
    assert_eq!(fresh.get("layer/proj").unwrap().kind(), Kind::Unclaimed);

    let y_fresh = fresh.scoped("layer", |s| proj(s, &x, 2)).values();
    assert_eq!(y_fresh, y_trained);
    assert_eq!(fresh.get("layer/proj").unwrap().kind(), Kind::Parameter);

    std::fs::remove_file(&path).ok();
}

#[test]
fn buffers_survive_a_round_trip() {
    let path = temp_path("buffers");
    let x = RawTensor::input((0..16).map(|i| i as f32).collect(), &[1, 2, 2, 4]);

    let mut state = State::with_seed(0);
    bn(&mut state, &x, BatchNormConfig::default());
    let running = state.get("bn/mean").unwrap().values();
    state.save(&path).unwrap();

    let mut restored = State::with_seed(0);
    restored.load(&path).unwrap();
    bn(&mut restored, &x, BatchNormConfig::default().test(true));
    assert_eq!(restored.get("bn/mean").unwrap().values(), running);
    assert_eq!(restored.get("bn/mean").unwrap().kind(), Kind::Buffer);

    std::fs::remove_file(&path).ok();
}

#[test]
fn remove_then_adamw_recreates_moments() {
    let mut state = State::with_seed(0);
    let (w, _) = state.get_or_create("w", &[2], Kind::Parameter, Init::Ones);
    w.borrow_mut().grad = Some(vec![1.0, -1.0]);

    let opt = AdamW::default();
    opt.step(&mut state);
    opt.step(&mut state);
    assert_eq!(state.get("adamw/w/t").unwrap().item(), 2.0);

    let m1 = state.get("adamw/w/m1").unwrap();
    assert_eq!(state.remove("adamw"), 3);
    assert!(m1.borrow().is_released());

    opt.step(&mut state);
    assert_eq!(state.get("adamw/w/t").unwrap().item(), 1.0);
}

#[test]
fn zero_grad_is_scope_filtered() {
    let mut state = State::with_seed(0);
    let (a, _) = state.get_or_create("enc/w", &[2], Kind::Parameter, Init::Ones);
    let (b, _) = state.get_or_create("dec/w", &[2], Kind::Parameter, Init::Ones);
    let (c, _) = state.get_or_create("dec/v", &[2], Kind::Parameter, Init::Ones);
    a.borrow_mut().grad = Some(vec![1.0, 1.0]);
    b.borrow_mut().grad = Some(vec![1.0, 1.0]);

    state.push("dec").zero_grad("");
    assert_eq!(a.grad(), Some(vec![1.0, 1.0]));
    assert_eq!(b.grad(), Some(vec![0.0, 0.0]));
    assert!(c.grad().is_none());
}
