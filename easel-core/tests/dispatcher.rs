use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use easel_core::{
    Dispatcher, Error, GenerationRequest, ModelFactory, ModelRegistry, PipelineSettings,
    TextToImage,
};
use image::{DynamicImage, RgbImage};

#[derive(Debug)]
struct SolidColor {
    width: u32,
    height: u32,
}

impl TextToImage for SolidColor {
    fn run(&self, _request: GenerationRequest) -> Result<DynamicImage> {
        Ok(DynamicImage::ImageRgb8(RgbImage::new(self.width, self.height)))
    }
}

/// Counts constructions instead of downloading weights.
#[derive(Clone, Default)]
struct StubFactory {
    builds: Arc<AtomicUsize>,
    built_keys: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
    fail: bool,
}

impl ModelFactory for StubFactory {
    async fn build(
        &self,
        key: &str,
        _source: &str,
        settings: &PipelineSettings,
    ) -> Result<Arc<dyn TextToImage>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.built_keys.lock().unwrap().push(key.to_string());
        anyhow::ensure!(!self.fail, "weights unavailable");
        Ok(Arc::new(SolidColor {
            width: settings.width as u32,
            height: settings.height as u32,
        }))
    }
}

fn dispatcher(factory: StubFactory) -> Dispatcher<StubFactory> {
    Dispatcher::new(ModelRegistry::default(), PipelineSettings::default(), factory)
}

fn request(prompt: &str) -> GenerationRequest {
    GenerationRequest::new(prompt)
}

#[tokio::test]
async fn unknown_model_key_fails_without_building_anything() {
    let factory = StubFactory::default();
    let builds = Arc::clone(&factory.builds);
    let dispatcher = dispatcher(factory);

    let mut req = request("x");
    req.model = Some("Unknown".to_string());
    let err = dispatcher.generate(req).await.unwrap_err();
    assert!(matches!(err, Error::UnknownModel(ref key) if key == "Unknown"));

    let err = dispatcher.resolve("Unknown").await.unwrap_err();
    assert!(matches!(err, Error::UnknownModel(_)));

    assert_eq!(builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn first_generate_builds_once_and_later_calls_reuse_it() {
    let factory = StubFactory::default();
    let builds = Arc::clone(&factory.builds);
    let dispatcher = dispatcher(factory);

    let mut req = request("a red bicycle");
    req.model = Some("StableDiffusion".to_string());
    req.steps = Some(20);
    req.guidance = Some(7.5);
    let image = dispatcher.generate(req).await.unwrap();
    assert_eq!(image.width(), 256);
    assert_eq!(image.height(), 256);
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    for _ in 0..5 {
        dispatcher.generate(request("a red bicycle")).await.unwrap();
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn distinct_prompts_share_one_pipeline() {
    let factory = StubFactory::default();
    let builds = Arc::clone(&factory.builds);
    let dispatcher = dispatcher(factory);

    let first = dispatcher.generate(request("a red bicycle")).await.unwrap();
    let second = dispatcher.generate(request("a blue teapot")).await.unwrap();
    assert_eq!(first.height(), second.height());
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resolve_returns_the_same_instance_both_times() {
    let dispatcher = dispatcher(StubFactory::default());

    let first = dispatcher.resolve("StableDiffusion").await.unwrap();
    let second = dispatcher.resolve("StableDiffusion").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn requests_without_a_model_use_the_default_key() {
    let factory = StubFactory::default();
    let built_keys = Arc::clone(&factory.built_keys);
    let dispatcher = dispatcher(factory);

    dispatcher.generate(request("a red bicycle")).await.unwrap();
    assert_eq!(*built_keys.lock().unwrap(), vec!["StableDiffusion".to_string()]);
}

#[tokio::test]
async fn a_failed_build_is_not_cached() {
    let factory = StubFactory {
        fail: true,
        ..StubFactory::default()
    };
    let builds = Arc::clone(&factory.builds);
    let dispatcher = dispatcher(factory);

    let err = dispatcher.generate(request("x")).await.unwrap_err();
    assert!(matches!(err, Error::Load { ref model, .. } if model == "StableDiffusion"));
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    // The key stays unloaded, so the next call attempts the build again.
    dispatcher.generate(request("x")).await.unwrap_err();
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_requests_share_a_single_build() {
    let factory = StubFactory {
        delay: Some(Duration::from_millis(50)),
        ..StubFactory::default()
    };
    let builds = Arc::clone(&factory.builds);
    let dispatcher = Arc::new(dispatcher(factory));

    let mut handles = Vec::new();
    for i in 0..4 {
        let dispatcher = Arc::clone(&dispatcher);
        handles.push(tokio::spawn(async move {
            dispatcher.generate(request(&format!("prompt {i}"))).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(builds.load(Ordering::SeqCst), 1);
}
