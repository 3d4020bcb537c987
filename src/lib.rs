pub mod api;
pub mod core;
pub mod frame_extractor;

pub fn init_logging() {
    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(log::LevelFilter::Debug)
                .with_tag("thumb_lib_rust"),
        );
    }

    #[cfg(not(target_os = "android"))]
    {
        // desktop hosts install their own `log` backend
    }
}
