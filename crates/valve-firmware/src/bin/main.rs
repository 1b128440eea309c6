#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_time::{Duration, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info};
use valve_core::bringup::Sequencer;
use valve_core::gpio::PinAvailability;
use valve_firmware::ap_config;
use valve_firmware::gpio::RegisterGpio;
use valve_firmware::platform::EspPlatform;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

static PINS: RegisterGpio = RegisterGpio::new(PinAvailability::ESP32S3);

/// Parks the device after a failed bring-up. Pins already driven keep their
/// level; nothing is serving requests.
async fn halt() -> ! {
    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("valve-ap starting");

    let network = match ap_config::network_config() {
        Ok(network) => network,
        Err(e) => {
            error!("build configuration rejected: {}", e);
            halt().await
        }
    };

    let platform = EspPlatform::new(spawner, peripherals.FLASH, peripherals.WIFI, &PINS);
    let sequencer = match Sequencer::new(&network, platform) {
        Ok(sequencer) => sequencer,
        Err(e) => {
            error!("{}", e);
            halt().await
        }
    };

    let platform = match sequencer.run().await {
        Ok(platform) => platform,
        Err(e) => {
            error!("device halted in {:?}", e.stage());
            halt().await
        }
    };
    platform.finish(&network);

    // The platform owns the radio controller; it has to outlive the loop
    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}
