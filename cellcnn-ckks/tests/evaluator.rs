use cellcnn_ckks::{
    rotations_for_inner_sum, rotations_for_replicate, CkksError, CkksParameters, CkksScheme,
    Complex64, Evaluator, Leveled, RnsCkks, SimulatedCkks, DEFAULT_SCALE,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn test_rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

struct Keys<S: CkksScheme> {
    sk: S::SecretKey,
    pk: S::PublicKey,
    evk: S::EvaluationKeys,
}

fn keygen<S: CkksScheme>(scheme: &S, rotations: &[i64]) -> Keys<S> {
    let mut rng = test_rng();
    let sk = scheme.gen_secret_key(&mut rng);
    let pk = scheme.gen_public_key(&sk, &mut rng);
    let evk = scheme.gen_evaluation_keys(&sk, rotations, &mut rng).unwrap();
    Keys { sk, pk, evk }
}

fn encrypt<S: CkksScheme>(scheme: &S, keys: &Keys<S>, v: &[f64], level: usize) -> S::Ciphertext {
    let vals: Vec<Complex64> = v.iter().map(|&x| Complex64::new(x, 0.0)).collect();
    let pt = scheme.encode(&vals, level, DEFAULT_SCALE).unwrap();
    scheme.encrypt(&pt, &keys.pk, &mut test_rng()).unwrap()
}

fn decrypt<S: CkksScheme>(scheme: &S, keys: &Keys<S>, ct: &S::Ciphertext) -> Vec<f64> {
    let pt = scheme.decrypt(ct, &keys.sk).unwrap();
    scheme.decode(&pt).iter().map(|c| c.re).collect()
}

fn sum_and_tile<S: CkksScheme>(scheme: &S, tol: f64) {
    let slots = scheme.params().slots();
    let (batch, n) = (3i64, 5usize);
    let mut rotations = rotations_for_inner_sum(batch, n);
    rotations.extend(rotations_for_replicate(batch, n));
    let keys = keygen(scheme, &rotations);
    let eval = Evaluator::new(scheme, &keys.evk);

    let v: Vec<f64> = (0..slots).map(|i| ((i * 7) % 11) as f64 / 10.0 - 0.5).collect();
    let ct = encrypt(scheme, &keys, &v, 2);

    let summed = decrypt(scheme, &keys, &eval.inner_sum(&ct, batch, n).unwrap());
    for s in 0..3 {
        let want: f64 = (0..n).map(|t| v[s + t * batch as usize]).sum();
        assert!((summed[s] - want).abs() < tol, "slot {}: {} vs {}", s, summed[s], want);
    }

    let mut prefix = vec![0.0; 3];
    prefix.copy_from_slice(&v[..3]);
    let ct = encrypt(scheme, &keys, &prefix, 2);
    let tiled = decrypt(scheme, &keys, &eval.replicate(&ct, batch, n).unwrap());
    for t in 0..n {
        for j in 0..3 {
            assert!((tiled[t * 3 + j] - prefix[j]).abs() < tol);
        }
    }
    assert!(tiled[3 * n].abs() < tol);
}

fn cubic<S: CkksScheme>(scheme: &S, tol: f64) {
    let keys = keygen(scheme, &[]);
    let eval = Evaluator::new(scheme, &keys.evk);
    let top = scheme.params().max_level();
    let xs: Vec<f64> = (0..16).map(|i| i as f64 / 8.0 - 1.0).collect();
    let ct = encrypt(scheme, &keys, &xs, top);
    let coeffs = [0.5, 0.24656666666666668, 0.0, -0.009070370370370371];

    let out = eval.evaluate_polynomial(&ct, &coeffs, DEFAULT_SCALE).unwrap();
    assert_eq!(out.level(), top - 2);
    assert!((out.scale() / DEFAULT_SCALE - 1.0).abs() < 1e-9);
    let got = decrypt(scheme, &keys, &out);
    for (x, y) in xs.iter().zip(got.iter()) {
        let want = coeffs[0] + coeffs[1] * x + coeffs[3] * x * x * x;
        assert!((y - want).abs() < tol, "σ({}) = {} vs {}", x, y, want);
    }

    let quad = eval.evaluate_polynomial(&ct, &[0.1, 0.0, 1.0], DEFAULT_SCALE).unwrap();
    let got = decrypt(scheme, &keys, &quad);
    for (x, y) in xs.iter().zip(got.iter()) {
        assert!((y - (0.1 + x * x)).abs() < tol);
    }

    let lin = eval.evaluate_polynomial(&ct, &[1.0, -2.0], DEFAULT_SCALE).unwrap();
    assert_eq!(lin.level(), top - 1);
    let got = decrypt(scheme, &keys, &lin);
    for (x, y) in xs.iter().zip(got.iter()) {
        assert!((y - (1.0 - 2.0 * x)).abs() < tol);
    }
}

#[test]
fn simulated_inner_sum_and_replicate() {
    let params = CkksParameters::new(8, 7, 4, DEFAULT_SCALE).unwrap();
    sum_and_tile(&SimulatedCkks::new(params), 1e-9);
}

#[test]
fn lattice_inner_sum_and_replicate() {
    let params = CkksParameters::new(6, 5, 3, DEFAULT_SCALE).unwrap();
    sum_and_tile(&RnsCkks::new(params).unwrap(), 1e-6);
}

#[test]
fn simulated_polynomial_evaluation() {
    let params = CkksParameters::new(8, 7, 5, DEFAULT_SCALE).unwrap();
    cubic(&SimulatedCkks::with_encryption_noise(params), 1e-6);
}

#[test]
fn lattice_polynomial_evaluation() {
    let params = CkksParameters::new(6, 5, 5, DEFAULT_SCALE).unwrap();
    cubic(&RnsCkks::new(params).unwrap(), 1e-5);
}

#[test]
fn align_scale_reaches_target() {
    let params = CkksParameters::new(8, 7, 4, DEFAULT_SCALE).unwrap();
    let scheme = SimulatedCkks::new(params);
    let keys = keygen(&scheme, &[]);
    let eval = Evaluator::new(&scheme, &keys.evk);
    let ct = encrypt(&scheme, &keys, &[0.25, -0.75], 3);
    let odd = eval.mul_const(&ct, 1.0, 1024.0).unwrap();
    let aligned = eval.align_scale(&odd, DEFAULT_SCALE).unwrap();
    assert_eq!(aligned.level(), 2);
    assert!((aligned.scale() / DEFAULT_SCALE - 1.0).abs() < 1e-9);
    let sum = eval.add(&aligned, &eval.drop_to_level(&ct, 2).unwrap()).unwrap();
    let got = decrypt(&scheme, &keys, &sum);
    assert!((got[0] - 0.5).abs() < 1e-6);
    assert!((got[1] + 1.5).abs() < 1e-6);
}

#[test]
fn polynomial_needs_levels() {
    let params = CkksParameters::new(8, 7, 2, DEFAULT_SCALE).unwrap();
    let scheme = SimulatedCkks::new(params);
    let keys = keygen(&scheme, &[]);
    let eval = Evaluator::new(&scheme, &keys.evk);
    let ct = encrypt(&scheme, &keys, &[0.5], 1);
    assert!(matches!(
        eval.evaluate_polynomial(&ct, &[0.0, 1.0, 0.0, 1.0], DEFAULT_SCALE),
        Err(CkksError::LevelExhausted { .. })
    ));
    assert!(matches!(
        eval.evaluate_polynomial(&ct, &[0.0, 0.0, 0.0, 0.0, 1.0], DEFAULT_SCALE),
        Err(CkksError::PolynomialDegree(4))
    ));
}
