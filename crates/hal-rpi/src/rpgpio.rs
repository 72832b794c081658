//! Direct register access to the BCM283x GPIO, DMA, PWM and clock-manager
//! blocks through `/dev/mem`, plus DMA-visible contiguous memory allocated
//! through the `/dev/vcio` mailbox. No kernel modules, no libraries; this is
//! the machine-room of the backend and nothing outside this module touches a
//! register.

use std::ffi::CString;
use std::io;
use std::time::Duration;

use tracing::{debug, info};

use crate::registers::*;

fn open_dev(path: &str) -> io::Result<libc::c_int> {
    let cpath = CString::new(path).expect("device path");
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_SYNC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// A `/dev/mem` mapping of one peripheral page (or a CMA region).
///
/// All accesses are volatile; `&self` methods are safe to share across the
/// heater and command threads because every touched register is either
/// write-only from one place or a set/clear pair that tolerates races.
pub struct PhysicalMemory {
    base: *mut u8,
    size: usize,
}

unsafe impl Send for PhysicalMemory {}
unsafe impl Sync for PhysicalMemory {}

impl PhysicalMemory {
    pub fn new(phys_address: u32, size: usize) -> io::Result<Self> {
        let aligned = phys_address - phys_address % PAGE_SIZE as u32;
        let fd = open_dev("/dev/mem")?;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                aligned as libc::off_t,
            )
        };
        unsafe { libc::close(fd) };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: base.cast(),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size);
        unsafe { self.base.add(offset).cast::<u32>().read_volatile() }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size);
        unsafe { self.base.add(offset).cast::<u32>().write_volatile(value) }
    }

    pub fn write_block(&self, offset: usize, words: &[u32]) {
        debug_assert!(offset + 4 * words.len() <= self.size);
        for (i, word) in words.iter().enumerate() {
            self.write_u32(offset + 4 * i, *word);
        }
    }
}

impl Drop for PhysicalMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}

const IOCTL_MBOX_PROPERTY: libc::c_ulong = 0xc004_6400;
const MBOX_ALLOCATE: u32 = 0x3000c;
const MBOX_LOCK: u32 = 0x3000d;
const MBOX_UNLOCK: u32 = 0x3000e;
const MBOX_FREE: u32 = 0x3000f;

/// Contiguous DMA-visible memory allocated and locked through the VideoCore
/// mailbox, mapped into our address space.
pub struct CmaMemory {
    memory: PhysicalMemory,
    vcio_fd: libc::c_int,
    handle: u32,
    bus_address: u32,
}

unsafe impl Send for CmaMemory {}
unsafe impl Sync for CmaMemory {}

impl CmaMemory {
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let vcio_fd = open_dev("/dev/vcio")?;
        let handle = mailbox(vcio_fd, MBOX_ALLOCATE, &[size as u32, PAGE_SIZE as u32, 0xC])?;
        if handle == 0 {
            unsafe { libc::close(vcio_fd) };
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "mailbox refused to allocate DMA memory",
            ));
        }
        let bus_address = mailbox(vcio_fd, MBOX_LOCK, &[handle])?;
        if bus_address == 0 {
            let _ = mailbox(vcio_fd, MBOX_FREE, &[handle]);
            unsafe { libc::close(vcio_fd) };
            return Err(io::Error::other("mailbox failed to lock DMA memory"));
        }
        let memory = PhysicalMemory::new(bus_address & !0xC000_0000, size)?;
        info!(
            target: "hal.rpi",
            size,
            bus_address = format_args!("{bus_address:#x}"),
            "cma_allocated"
        );
        Ok(Self {
            memory,
            vcio_fd,
            handle,
            bus_address,
        })
    }

    pub fn bus_address(&self) -> u32 {
        self.bus_address
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }
}

impl Drop for CmaMemory {
    fn drop(&mut self) {
        let _ = mailbox(self.vcio_fd, MBOX_UNLOCK, &[self.handle]);
        let _ = mailbox(self.vcio_fd, MBOX_FREE, &[self.handle]);
        unsafe { libc::close(self.vcio_fd) };
    }
}

/// One property-interface request: returns the first response value.
fn mailbox(fd: libc::c_int, request: u32, args: &[u32]) -> io::Result<u32> {
    let mut data = Vec::with_capacity(args.len() + 6);
    data.push((24 + 4 * args.len()) as u32); // total size
    data.push(0); // process request
    data.push(request);
    data.push(4 * args.len() as u32); // buffer size
    data.push(4 * args.len() as u32); // data size
    data.extend_from_slice(args);
    data.push(0); // end tag
    let rc = unsafe { libc::ioctl(fd, IOCTL_MBOX_PROPERTY, data.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(data[5])
}

/// Detect the SoC peripheral base from `/proc/cpuinfo`, which doubles as the
/// "are we on a Pi at all" probe.
pub fn peripheral_base() -> io::Result<u32> {
    const RPI_1_REVISIONS: &[&str] = &[
        "0002", "0003", "0004", "0005", "0006", "0007", "0008", "0009", "000d", "000e", "000f",
        "0010", "0011", "0012", "0013", "0014", "0015", "900021", "900032",
    ];
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo")?;
    let field = |name: &str| {
        cpuinfo.lines().find_map(|l| {
            let (key, value) = l.split_once(':')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
    };
    let hardware = field("Hardware")
        .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "not a raspberry pi board"))?;
    match field("Revision") {
        Some(rev) if RPI_1_REVISIONS.contains(&rev.as_str()) => Ok(RPI1_PERI_BASE),
        _ if hardware.contains("BCM2") => Ok(RPI2_3_PERI_BASE),
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unknown raspberry pi board",
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Output,
    InputNoPull,
    InputPullUp,
    InputPullDown,
}

/// Plain GPIO access.
pub struct Gpio {
    mem: PhysicalMemory,
}

impl Gpio {
    pub fn new(peri_base: u32) -> io::Result<Self> {
        Ok(Self {
            mem: PhysicalMemory::new(peri_base + GPIO_REGISTER_BASE, PAGE_SIZE)?,
        })
    }

    pub fn init(&self, pin: u32, mode: PinMode) {
        let address = 4 * (pin as usize / 10) + GPIO_FSEL_OFFSET;
        let mut v = self.mem.read_u32(address);
        v &= !(7 << ((pin % 10) * 3)); // input
        if mode == PinMode::Output {
            v |= 1 << ((pin % 10) * 3);
            self.mem.write_u32(address, v);
        } else {
            self.mem.write_u32(address, v);
            self.pull_up_down(pin, mode);
        }
    }

    fn pull_up_down(&self, pin: u32, mode: PinMode) {
        let mut p = self.mem.read_u32(GPIO_PULLUPDN_OFFSET) & !3;
        match mode {
            PinMode::InputPullUp => p |= 2,
            PinMode::InputPullDown => p |= 1,
            _ => {}
        }
        self.mem.write_u32(GPIO_PULLUPDN_OFFSET, p);
        let clock = 4 * (pin as usize / 32) + GPIO_PULLUPDNCLK_OFFSET;
        self.mem.write_u32(clock, 1 << (pin % 32));
        let p = self.mem.read_u32(GPIO_PULLUPDN_OFFSET) & !3;
        self.mem.write_u32(GPIO_PULLUPDN_OFFSET, p);
        self.mem.write_u32(clock, 0);
    }

    pub fn set(&self, pin: u32) {
        let address = 4 * (pin as usize / 32) + GPIO_SET_OFFSET;
        self.mem.write_u32(address, 1 << (pin % 32));
    }

    pub fn clear(&self, pin: u32) {
        let address = 4 * (pin as usize / 32) + GPIO_CLEAR_OFFSET;
        self.mem.write_u32(address, 1 << (pin % 32));
    }

    pub fn read(&self, pin: u32) -> u32 {
        let address = 4 * (pin as usize / 32) + GPIO_INPUT_OFFSET;
        let v = self.mem.read_u32(address);
        u32::from(v & (1 << (pin % 32)) != 0)
    }
}

const CONTROL_BLOCK_SIZE: usize = 32;

/// GPIO pulse sequencer on a DMA channel, clocked by the PWM FIFO for
/// microsecond-accurate delays.
///
/// Keep a single instance: two concurrent users would fight over the PWM
/// pacing clock and skew each other's delays.
pub struct DmaGpio {
    buffer: CmaMemory,
    dma: PhysicalMemory,
    pwm: PhysicalMemory,
    clock: PhysicalMemory,
    channel: usize,
    current_address: usize,
    delay_info: u32,
    pulse_info: u32,
    pulse_length: u32,
    pulse_stride: u32,
}

impl DmaGpio {
    pub fn new(peri_base: u32, buffer_size: usize, channel: usize) -> io::Result<Self> {
        Ok(Self {
            buffer: CmaMemory::new(buffer_size)?,
            dma: PhysicalMemory::new(peri_base + DMA_BASE, PAGE_SIZE)?,
            pwm: PhysicalMemory::new(peri_base + PWM_BASE, PAGE_SIZE)?,
            clock: PhysicalMemory::new(peri_base + CM_BASE, PAGE_SIZE)?,
            channel,
            current_address: 0,
            delay_info: DMA_TI_NO_WIDE_BURSTS
                | DMA_SRC_IGNORE
                | dma_ti_per_map(DMA_TI_PER_MAP_PWM)
                | DMA_TI_DEST_DREQ,
            pulse_info: DMA_TI_NO_WIDE_BURSTS | DMA_TI_TDMODE | DMA_TI_WAIT_RESP,
            // YLENGTH counts transfers, XLENGTH the size of each
            pulse_length: dma_ti_txfr_len_ylength(2) | dma_ti_txfr_len_xlength(4),
            pulse_stride: dma_ti_stride_d(12) | dma_ti_stride_s(4),
        })
    }

    pub const fn control_block_size(&self) -> usize {
        CONTROL_BLOCK_SIZE
    }

    fn ensure_room(&self, blocks: usize) -> io::Result<usize> {
        let next = self.current_address + blocks * CONTROL_BLOCK_SIZE;
        if next > self.buffer.memory().size() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "out of allocated DMA memory",
            ));
        }
        Ok(next)
    }

    /// Pulse `pins_mask` high for `length_us`. Three control blocks: set,
    /// clocked delay, clear; the 8 padding bytes of each block store the pin
    /// data the 2D-mode transfer picks up.
    pub fn add_pulse(&mut self, pins_mask: u32, length_us: u32) -> io::Result<()> {
        let next_cb = self.ensure_room(3)?;
        let bus = self.buffer.bus_address();
        let next3 = next_cb as u32 + bus;
        let next2 = next3 - CONTROL_BLOCK_SIZE as u32;
        let next1 = next2 - CONTROL_BLOCK_SIZE as u32;

        let source1 = next1 - 8; // padding bytes hold the data
        let length2 = length_us << 4; // 16 ticks of the 16 MHz-equivalent FIFO pace
        let source3 = next3 - 8;

        let data = [
            // control block 1 - set
            self.pulse_info,
            source1,
            PHYSICAL_GPIO_BUS + GPIO_SET_OFFSET as u32,
            self.pulse_length,
            self.pulse_stride,
            next1,
            pins_mask,
            0,
            // control block 2 - delay
            self.delay_info,
            0,
            PHYSICAL_PWM_BUS + PWM_FIFO as u32,
            length2,
            0,
            next2,
            0,
            0,
            // control block 3 - clear
            self.pulse_info,
            source3,
            PHYSICAL_GPIO_BUS + GPIO_SET_OFFSET as u32,
            self.pulse_length,
            self.pulse_stride,
            next3,
            0,
            pins_mask,
        ];
        self.buffer.memory().write_block(self.current_address, &data);
        self.current_address = next_cb;
        Ok(())
    }

    pub fn add_delay(&mut self, delay_us: u32) -> io::Result<()> {
        let next_cb = self.ensure_room(1)?;
        let next1 = self.buffer.bus_address() + next_cb as u32;
        let source = next1 - 8;
        let data = [
            self.delay_info,
            source,
            PHYSICAL_PWM_BUS + PWM_FIFO as u32,
            delay_us << 4,
            0,
            next1,
            0,
            0,
        ];
        self.buffer.memory().write_block(self.current_address, &data);
        self.current_address = next_cb;
        Ok(())
    }

    /// Set and clear pin levels in one block (direction updates).
    pub fn add_set_clear(&mut self, pins_to_set: u32, pins_to_clear: u32) -> io::Result<()> {
        let next_cb = self.ensure_room(1)?;
        let next1 = self.buffer.bus_address() + next_cb as u32;
        let source = next1 - 8;
        let data = [
            self.pulse_info,
            source,
            PHYSICAL_GPIO_BUS + GPIO_SET_OFFSET as u32,
            self.pulse_length,
            self.pulse_stride,
            next1,
            pins_to_set,
            pins_to_clear,
        ];
        self.buffer.memory().write_block(self.current_address, &data);
        self.current_address = next_cb;
        Ok(())
    }

    /// Terminate the chain at the current position.
    pub fn finalize_stream(&mut self) {
        if self.current_address == 0 {
            return;
        }
        self.buffer
            .memory()
            .write_u32(self.current_address + 20 - CONTROL_BLOCK_SIZE, 0);
        debug!(
            target: "hal.rpi",
            bytes = self.current_address,
            "dma_chain_finalized"
        );
    }

    /// Start the DMA without finalizing: callers keep appending ahead of the
    /// running chain.
    pub fn run_stream(&mut self) {
        // PWM module paces the delay blocks
        self.pwm.write_u32(PWM_CTL, 0);
        self.clock.write_u32(CM_PWM_CNTL, CM_PASSWORD | CM_SRC_PLLD);
        while self.clock.read_u32(CM_PWM_CNTL) & CM_CNTL_BUSY != 0 {
            std::thread::sleep(Duration::from_micros(10));
        }
        self.clock
            .write_u32(CM_PWM_DIV, CM_PASSWORD | cm_div_value(5)); // 100 MHz
        self.clock
            .write_u32(CM_PWM_CNTL, CM_PASSWORD | CM_SRC_PLLD | CM_CNTL_ENABLE);

        self.pwm.write_u32(PWM_RNG1, 100);
        self.pwm.write_u32(
            PWM_DMAC,
            PWM_DMAC_ENAB | pwm_dmac_panic(15) | pwm_dmac_dreq(15),
        );
        self.pwm.write_u32(PWM_CTL, PWM_CTL_CLRF);
        self.pwm.write_u32(PWM_CTL, PWM_CTL_USEF1 | PWM_CTL_PWEN1);
        run_dma(&self.dma, self.channel, self.buffer.bus_address());
    }

    /// Finalize (or loop) and start.
    pub fn run(&mut self, repeat: bool) {
        if self.current_address == 0 {
            return;
        }
        if repeat {
            self.buffer.memory().write_u32(
                self.current_address + 20 - CONTROL_BLOCK_SIZE,
                self.buffer.bus_address(),
            );
        } else {
            self.finalize_stream();
        }
        self.run_stream();
    }

    pub fn stop(&mut self) {
        self.pwm.write_u32(PWM_CTL, 0);
        stop_dma(&self.dma, self.channel);
    }

    /// Forget everything appended so far. Does not affect a running chain.
    pub fn clear(&mut self) {
        self.current_address = 0;
    }

    pub fn is_active(&self) -> bool {
        dma_active(&self.dma, self.channel)
    }

    /// Bus address of the append frontier.
    pub fn current_address(&self) -> u32 {
        self.buffer.bus_address() + self.current_address as u32
    }

    /// Bus address of the control block the engine is executing, if any.
    pub fn active_control_block(&self) -> Option<u32> {
        if !self.is_active() {
            return None;
        }
        let address = 0x100 * self.channel + DMA_CONBLK_AD;
        let cb = self.dma.read_u32(address);
        (cb != 0).then_some(cb)
    }
}

fn run_dma(dma: &PhysicalMemory, channel: usize, chain_bus_address: u32) {
    let address = 0x100 * channel;
    dma.write_u32(address + DMA_CS, DMA_CS_END);
    dma.write_u32(address + DMA_CONBLK_AD, chain_bus_address);
    let cs = dma_cs_priority(7) | dma_cs_panic_priority(7) | DMA_CS_DISDEBUG;
    dma.write_u32(address + DMA_CS, cs);
    dma.write_u32(address + DMA_CS, cs | DMA_CS_ACTIVE);
}

fn stop_dma(dma: &PhysicalMemory, channel: usize) {
    let address = 0x100 * channel;
    let mut cs = dma.read_u32(address + DMA_CS);
    cs |= DMA_CS_ABORT;
    dma.write_u32(address + DMA_CS, cs);
    cs &= !DMA_CS_ACTIVE;
    dma.write_u32(address + DMA_CS, cs);
    cs |= DMA_CS_RESET;
    dma.write_u32(address + DMA_CS, cs);
}

fn dma_active(dma: &PhysicalMemory, channel: usize) -> bool {
    let address = 0x100 * channel;
    dma.read_u32(address + DMA_CS) & DMA_CS_ACTIVE != 0
}

const PWM_BLOCKS: usize = 256;
const PWM_DATA_OFFSET: usize = 24;

/// Slow software PWM over GPIO on a lite DMA channel: 8-bit resolution at a
/// fixed ~11.5 kHz, cheap enough for heaters and collector motors. The first
/// block sets subscribed pins, each later block clears the pins whose duty
/// cycle expired there, and the chain loops forever.
pub struct DmaPwm {
    buffer: CmaMemory,
    dma: PhysicalMemory,
    gpio: PhysicalMemory,
    channel: usize,
    clear_addresses: std::collections::HashMap<u32, usize>,
}

impl DmaPwm {
    pub fn new(peri_base: u32, channel: usize) -> io::Result<Self> {
        let pwm = Self {
            buffer: CmaMemory::new(PWM_BLOCKS * CONTROL_BLOCK_SIZE)?,
            dma: PhysicalMemory::new(peri_base + DMA_BASE, PAGE_SIZE)?,
            gpio: PhysicalMemory::new(peri_base + GPIO_REGISTER_BASE, PAGE_SIZE)?,
            channel,
            clear_addresses: std::collections::HashMap::new(),
        };
        pwm.add_control_block(0, GPIO_SET_OFFSET);
        for i in 1..PWM_BLOCKS {
            pwm.add_control_block(i * CONTROL_BLOCK_SIZE, GPIO_CLEAR_OFFSET);
        }
        // loop the chain
        pwm.buffer.memory().write_u32(
            (PWM_BLOCKS - 1) * CONTROL_BLOCK_SIZE + 20,
            pwm.buffer.bus_address(),
        );
        Ok(pwm)
    }

    fn add_control_block(&self, address: usize, gpio_offset: usize) {
        let ba = self.buffer.bus_address() + address as u32;
        let data = [
            DMA_TI_NO_WIDE_BURSTS | DMA_TI_WAIT_RESP | DMA_TI_DEST_INC | DMA_TI_SRC_INC,
            ba + PWM_DATA_OFFSET as u32, // source: the block's own padding
            PHYSICAL_GPIO_BUS + gpio_offset as u32,
            4,
            0,
            ba + CONTROL_BLOCK_SIZE as u32,
            0, // padding doubles as pin data
            0,
        ];
        self.buffer.memory().write_block(address, &data);
    }

    /// Subscribe `pin` at `duty_cycle` percent.
    pub fn add_pin(&mut self, pin: u32, duty_cycle: f64) {
        debug_assert!((0.0..=100.0).contains(&duty_cycle));
        self.remove_pin(pin);
        let block = (duty_cycle * PWM_BLOCKS as f64 / 100.0) as usize;
        if block == 0 {
            self.gpio
                .write_u32(GPIO_CLEAR_OFFSET, 1 << pin);
        } else if block >= PWM_BLOCKS {
            self.gpio.write_u32(GPIO_SET_OFFSET, 1 << pin);
            self.clear_addresses.insert(pin, PWM_DATA_OFFSET);
        } else {
            let mem = self.buffer.memory();
            let set = mem.read_u32(PWM_DATA_OFFSET) | 1 << pin;
            mem.write_u32(PWM_DATA_OFFSET, set);
            let clear_address = block * CONTROL_BLOCK_SIZE + PWM_DATA_OFFSET;
            let clear = mem.read_u32(clear_address) | 1 << pin;
            mem.write_u32(clear_address, clear);
            self.clear_addresses.insert(pin, clear_address);
            if !dma_active(&self.dma, self.channel) {
                run_dma(&self.dma, self.channel, self.buffer.bus_address());
            }
        }
    }

    pub fn remove_pin(&mut self, pin: u32) {
        debug_assert!(pin < 32);
        if let Some(address) = self.clear_addresses.remove(&pin) {
            let mem = self.buffer.memory();
            mem.write_u32(address, mem.read_u32(address) & !(1 << pin));
            mem.write_u32(
                PWM_DATA_OFFSET,
                mem.read_u32(PWM_DATA_OFFSET) & !(1 << pin),
            );
            self.gpio.write_u32(GPIO_CLEAR_OFFSET, 1 << pin);
        }
        if self.clear_addresses.is_empty() && dma_active(&self.dma, self.channel) {
            stop_dma(&self.dma, self.channel);
        }
    }

    pub fn remove_all(&mut self) {
        let pins: Vec<u32> = self.clear_addresses.keys().copied().collect();
        for pin in pins {
            self.remove_pin(pin);
        }
    }
}
