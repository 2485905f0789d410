//! Renderer timing behaviour, driven by tokio's paused clock

mod common;

use common::{Counters, FakeBackend, Site};
use pagediff::capture::{self, RenderSettings};
use pagediff::{Error, Viewport};
use std::time::Duration;
use tokio::time::Instant;

const URL: &str = "https://lazy.test/";

fn loaded_page(site: Site) -> (FakeBackend, common::FakePage) {
    let backend = FakeBackend::new().with_site(URL, site);
    let page = backend.page(Viewport::new(800, 600));
    (backend, page)
}

#[tokio::test(start_paused = true)]
async fn image_waits_run_concurrently() {
    let mut site = Site::white(800, 600);
    site.image_delays = vec![
        Duration::from_secs(3),
        Duration::from_secs(4),
        Duration::from_secs(2),
    ];
    let (backend, page) = loaded_page(site);
    let settings = RenderSettings::default();
    capture::navigate_until_idle(&page, URL, &settings).await.unwrap();

    let started = Instant::now();
    let outcome = capture::await_images(&page, &settings).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.loaded, 3);
    assert_eq!(outcome.timed_out, 0);
    // bounded by the slowest image, not the sum
    assert!(elapsed >= Duration::from_secs(4), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);
    assert_eq!(Counters::get(&backend.counters.max_image_waits), 3);
    assert_eq!(Counters::get(&backend.counters.active_image_waits), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_image_times_out_without_failing() {
    let mut site = Site::white(800, 600);
    site.image_delays = vec![Duration::from_secs(1), Duration::from_secs(60)];
    let (backend, page) = loaded_page(site);
    let settings = RenderSettings::default();
    capture::navigate_until_idle(&page, URL, &settings).await.unwrap();

    let started = Instant::now();
    let outcome = capture::await_images(&page, &settings).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.loaded, 1);
    assert_eq!(outcome.timed_out, 1);
    assert!(elapsed >= settings.image_timeout);
    assert!(elapsed < settings.image_timeout + Duration::from_secs(1));
    // the timed-out wait was cancelled
    assert_eq!(Counters::get(&backend.counters.active_image_waits), 0);
}

#[tokio::test(start_paused = true)]
async fn endless_page_hits_scroll_cap() {
    let mut site = Site::white(800, 600);
    site.scroll_height = 10_000_000;
    site.max_scroll_height = 10_000_000;
    let (_backend, page) = loaded_page(site);
    let settings = RenderSettings {
        max_scroll_duration: Duration::from_secs(2),
        ..Default::default()
    };
    capture::navigate_until_idle(&page, URL, &settings).await.unwrap();

    let started = Instant::now();
    let outcome = capture::scroll_through(&page, &settings).await.unwrap();

    assert!(outcome.capped);
    assert!((20..=22).contains(&outcome.steps), "{} steps", outcome.steps);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn growing_page_is_scrolled_to_its_new_bottom() {
    let mut site = Site::white(800, 600);
    site.scroll_height = 300;
    site.growth_per_step = 100;
    site.max_scroll_height = 1000;
    let (_backend, page) = loaded_page(site);
    let settings = RenderSettings::default();
    capture::navigate_until_idle(&page, URL, &settings).await.unwrap();

    let outcome = capture::scroll_through(&page, &settings).await.unwrap();

    assert!(!outcome.capped);
    assert_eq!(outcome.distance, 1000);
    assert_eq!(outcome.steps, 10);
}

#[tokio::test(start_paused = true)]
async fn network_idle_requires_quiet_window() {
    let mut site = Site::white(800, 600);
    site.resource_counts = vec![1, 2, 3, 4, 5, 5];
    let (_backend, page) = loaded_page(site);
    let settings = RenderSettings::default();

    let started = Instant::now();
    capture::navigate_until_idle(&page, URL, &settings).await.unwrap();
    let elapsed = started.elapsed();

    // four changes at 100ms intervals, then a full quiet window
    assert!(elapsed >= Duration::from_millis(400) + settings.idle_window, "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn busy_network_fails_with_navigation_error() {
    let mut site = Site::white(800, 600);
    site.busy_network = true;
    let (_backend, page) = loaded_page(site);
    let settings = RenderSettings::default();

    let started = Instant::now();
    let err = capture::navigate_until_idle(&page, URL, &settings).await.unwrap_err();

    assert!(matches!(err, Error::NavigationError(_)), "{:?}", err);
    assert!(started.elapsed() >= settings.navigation_timeout);
}

#[tokio::test(start_paused = true)]
async fn hanging_navigation_times_out() {
    let mut site = Site::white(800, 600);
    site.hang = true;
    let (_backend, page) = loaded_page(site);
    let settings = RenderSettings {
        navigation_timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let err = capture::navigate_until_idle(&page, URL, &settings).await.unwrap_err();
    assert!(matches!(err, Error::NavigationError(ref msg) if msg.contains("10000ms")), "{:?}", err);
}

#[tokio::test(start_paused = true)]
async fn slow_resource_queries_stay_within_navigation_timeout() {
    let mut site = Site::white(800, 600);
    site.resource_delay = Duration::from_secs(25);
    let (_backend, page) = loaded_page(site);
    let settings = RenderSettings::default();

    let started = Instant::now();
    let err = capture::navigate_until_idle(&page, URL, &settings).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::NavigationError(ref msg) if msg.contains("30000ms")), "{:?}", err);
    assert!(elapsed >= settings.navigation_timeout, "{:?}", elapsed);
    assert!(elapsed <= settings.navigation_timeout + Duration::from_millis(10), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn network_idle_counts_past_timing_buffer_size() {
    let mut site = Site::white(800, 600);
    // climbs through 250 and keeps going before settling
    site.resource_counts = (0..=12).map(|i| 240 + i * 5).collect();
    let (_backend, page) = loaded_page(site);
    let settings = RenderSettings::default();

    let started = Instant::now();
    capture::navigate_until_idle(&page, URL, &settings).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(1200) + settings.idle_window, "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn unknown_host_is_a_navigation_error() {
    let (_backend, page) = loaded_page(Site::white(800, 600));
    let err = capture::render(&page, "https://nowhere.invalid/", page.viewport(), &RenderSettings::default())
        .await
        .unwrap_err();
    assert!(err.is_navigation());
}

#[tokio::test(start_paused = true)]
async fn render_produces_full_page_image() {
    let mut site = Site::new(800, 2400, [10, 20, 30, 255]);
    site.scroll_height = 2400;
    site.max_scroll_height = 2400;
    site.image_delays = vec![Duration::from_millis(250)];
    let (_backend, page) = loaded_page(site);

    let image = capture::render(&page, URL, page.viewport(), &RenderSettings::default())
        .await
        .unwrap();

    assert_eq!((image.width(), image.height()), (800, 2400));
    assert_eq!(image.as_rgba().get_pixel(5, 2000).0, [10, 20, 30, 255]);
}
