use std::cell::RefCell;
use std::rc::Rc;

use kestrel_mem::{BlockKind, Bus, BusConfig, TrapHook};
use pretty_assertions::assert_eq;

fn ram_bus() -> Bus {
    let mut bus = Bus::new(BusConfig::default()).unwrap();
    bus.add_blocks(0x2000, 1024, BlockKind::Ram).unwrap();
    bus
}

fn recording_hook() -> (TrapHook, Rc<RefCell<Vec<(u32, u32, Option<u32>)>>>) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let log2 = Rc::clone(&log);
    let hook: TrapHook = Rc::new(move |addr, value, origin| {
        log2.borrow_mut().push((addr, value, origin));
    });
    (hook, log)
}

#[test]
fn write_trap_sees_the_value_exactly_once() {
    let mut bus = ram_bus();
    bus.write_data(0x2050, 0x11);

    let (hook, log) = recording_hook();
    assert!(bus.trap_write(0x2050, &hook));
    bus.write_data(0x2050, 0xCC);

    assert_eq!(*log.borrow(), vec![(0x2050, 0xCC, None)]);
    assert_eq!(bus.read_data(0x2050), 0xCC);
}

#[test]
fn read_trap_fires_after_read_with_the_value() {
    let mut bus = ram_bus();
    bus.write_data(0x2050, 0xAB);

    let (hook, log) = recording_hook();
    assert!(bus.trap_read(0x2050, &hook));

    assert_eq!(bus.read_data(0x2050), 0xAB);
    assert_eq!(*log.borrow(), vec![(0x2050, 0xAB, None)]);
}

#[test]
fn origin_annotation_reaches_the_hook() {
    let mut bus = ram_bus();
    let (hook, log) = recording_hook();
    assert!(bus.trap_read(0x2000, &hook));

    bus.read_data_from(0x2010, 0xF123);
    assert_eq!(*log.borrow(), vec![(0x2010, 0x00, Some(0xF123))]);
}

#[test]
fn trap_covers_the_whole_block_not_one_address() {
    let mut bus = ram_bus();
    let (hook, log) = recording_hook();
    assert!(bus.trap_read(0x2000, &hook));

    bus.read_data(0x2000);
    bus.read_data(0x23FF);
    // Next block over is untrapped.
    bus.read_data(0x2400);

    assert_eq!(log.borrow().len(), 2);
}

#[test]
fn untrap_restores_transparency() {
    let mut bus = ram_bus();
    bus.write_data(0x2050, 0x42);

    let (hook, log) = recording_hook();
    assert!(bus.trap_read(0x2050, &hook));
    assert!(bus.untrap_read(0x2050, &hook));

    assert_eq!(bus.read_data(0x2050), 0x42);
    assert!(log.borrow().is_empty());
    // Nothing left to remove.
    assert!(!bus.untrap_read(0x2050, &hook));
}

#[test]
fn traps_are_reference_counted() {
    let mut bus = ram_bus();
    let (hook, log) = recording_hook();

    assert!(bus.trap_read(0x2050, &hook));
    assert!(bus.trap_read(0x2050, &hook));
    assert!(bus.untrap_read(0x2050, &hook));

    // One reference remains; the trap still fires.
    bus.read_data(0x2050);
    assert_eq!(log.borrow().len(), 1);

    assert!(bus.untrap_read(0x2050, &hook));
    bus.read_data(0x2050);
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn second_distinct_hook_is_rejected() {
    let mut bus = ram_bus();
    let (first, _) = recording_hook();
    let (second, second_log) = recording_hook();

    assert!(bus.trap_write(0x2050, &first));
    assert!(!bus.trap_write(0x2050, &second));

    bus.write_data(0x2050, 1);
    assert!(second_log.borrow().is_empty());

    // The rejected hook never counted as installed.
    assert!(!bus.untrap_write(0x2050, &second));
    assert!(bus.untrap_write(0x2050, &first));
}

#[test]
fn read_and_write_traps_are_independent() {
    let mut bus = ram_bus();
    let (read_hook, read_log) = recording_hook();
    let (write_hook, write_log) = recording_hook();

    assert!(bus.trap_read(0x2050, &read_hook));
    assert!(bus.trap_write(0x2050, &write_hook));

    bus.write_data(0x2050, 0x77);
    bus.read_data(0x2050);

    assert_eq!(*read_log.borrow(), vec![(0x2050, 0x77, None)]);
    assert_eq!(*write_log.borrow(), vec![(0x2050, 0x77, None)]);
}
