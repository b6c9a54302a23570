//! Fuzz the control request dispatcher.

#![no_main]

use libfuzzer_sys::{arbitrary::{Arbitrary, Result, Unstructured}, fuzz_target};

use gadgetry::enumerator::{ControlOutcome, DeviceState, Enumerator};
use gadgetry::controller::Controller;
use gadgetry::irq::InterruptControl;
use gadgetry::setup::SetupPacket;
use gadgetry::testing::composite_enumerator;

fn check_state<C, I>(enumerator: &Enumerator<C, I>)
    where C: Controller, I: InterruptControl
{
    let status = enumerator.status();
    let selected = enumerator.registry().selected().entry.value;
    match status.state {
        DeviceState::Default => {
            assert_eq!(status.address.0, 0);
            assert_eq!(status.configuration, 0);
        },
        DeviceState::Addressed => {
            assert_ne!(status.address.0, 0);
            assert_eq!(status.configuration, 0);
        },
        DeviceState::Configured => {
            assert_ne!(status.configuration, 0);
            assert_eq!(status.configuration, selected);
        },
    }
}

fn run(input: &mut Unstructured) -> Result<()> {
    let fixture = composite_enumerator();
    let enumerator = &fixture.enumerator;
    let mut last = [0; 8];
    while !input.is_empty() {
        match u8::arbitrary(input)? % 8 {
            0..=3 => {
                last = <[u8; 8]>::arbitrary(input)?;
                if let ControlOutcome::Data(length) =
                    enumerator.handle_setup(&last)
                {
                    let requested = SetupPacket::decode(&last).length;
                    assert!(length <= requested as usize);
                }
            },
            4 => {
                let size = usize::from(u8::arbitrary(input)? % 65);
                let mut packet = vec![0; size];
                let words = SetupPacket::decode(&last).words();
                if let Ok(count) = enumerator.read_in(words, &mut packet) {
                    assert!(count <= size);
                }
            },
            5 => {
                let data = Vec::<u8>::arbitrary(input)?;
                let words = SetupPacket::decode(&last).words();
                let _ = enumerator.write_out(words, &data);
            },
            6 => enumerator.bus_reset(),
            _ => {
                let _ = enumerator.reassemble();
            },
        }
        check_state(enumerator);
    }
    Ok(())
}

fuzz_target!(|data: &[u8]| {
    let mut input = Unstructured::new(data);
    let _ = run(&mut input);
});
