// Smoke test against the real exported CRNN, when it is available locally
#[cfg(test)]
mod model_tests {
    use std::path::PathBuf;

    use captcha_solver_node::{
        CtcDecoder, InferenceEngine, OnnxEngine, PreprocessConfig, Preprocessor, Vocabulary,
    };

    #[test]
    fn test_onnx_model_end_to_end() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info,ort=error")
            .try_init();

        let model_path = std::env::var("CAPTCHA_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("captcha_crnn.onnx"));
        let test_image = PathBuf::from("/tmp/captcha_test.png");

        if !model_path.exists() || !test_image.exists() {
            eprintln!(
                "⚠️  Skipping model test: need {} and {}",
                model_path.display(),
                test_image.display()
            );
            return;
        }

        let bytes = std::fs::read(&test_image).expect("read test image");
        let prepared = Preprocessor::new(PreprocessConfig::default())
            .process_bytes(&bytes)
            .expect("preprocess");

        let mut engine = OnnxEngine::load(&model_path, "input").expect("load model");
        let logits = engine.run(&prepared.tensor).expect("run model");

        let vocab = Vocabulary::default();
        assert_eq!(logits.dim().1, 1, "batch dimension");
        assert_eq!(logits.dim().2, vocab.num_classes(), "class dimension");

        let texts = CtcDecoder::new(vocab).decode(logits.view()).expect("decode");
        println!("✓ Solved: {:?} ({} columns)", texts[0], logits.dim().0);
        assert!(texts[0].chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
