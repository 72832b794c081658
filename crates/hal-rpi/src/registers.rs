//! BCM283x peripheral register map, as documented in the Broadcom
//! "BCM2835 ARM Peripherals" datasheet. Only the registers this backend
//! touches are listed.

pub const RPI1_PERI_BASE: u32 = 0x2000_0000;
pub const RPI2_3_PERI_BASE: u32 = 0x3F00_0000;
pub const PAGE_SIZE: usize = 4096;

pub const GPIO_REGISTER_BASE: u32 = 0x20_0000;
pub const GPIO_FSEL_OFFSET: usize = 0x0;
pub const GPIO_SET_OFFSET: usize = 0x1C;
pub const GPIO_CLEAR_OFFSET: usize = 0x28;
pub const GPIO_INPUT_OFFSET: usize = 0x34;
pub const GPIO_PULLUPDN_OFFSET: usize = 0x94;
pub const GPIO_PULLUPDNCLK_OFFSET: usize = 0x98;
/// GPIO block on the VC bus, used as a DMA destination.
pub const PHYSICAL_GPIO_BUS: u32 = 0x7E00_0000 + GPIO_REGISTER_BASE;

pub const DMA_BASE: u32 = 0x00_7000;
pub const DMA_CS: usize = 0x00;
pub const DMA_CONBLK_AD: usize = 0x04;
pub const DMA_TI_NO_WIDE_BURSTS: u32 = 1 << 26;
pub const DMA_TI_SRC_INC: u32 = 1 << 8;
pub const DMA_TI_DEST_INC: u32 = 1 << 4;
pub const DMA_SRC_IGNORE: u32 = 1 << 11;
pub const DMA_TI_TDMODE: u32 = 1 << 1;
pub const DMA_TI_WAIT_RESP: u32 = 1 << 3;
pub const DMA_TI_DEST_DREQ: u32 = 1 << 6;
pub const DMA_CS_RESET: u32 = 1 << 31;
pub const DMA_CS_ABORT: u32 = 1 << 30;
pub const DMA_CS_DISDEBUG: u32 = 1 << 28;
pub const DMA_CS_END: u32 = 1 << 1;
pub const DMA_CS_ACTIVE: u32 = 1 << 0;
pub const DMA_TI_PER_MAP_PWM: u32 = 5;

pub const fn dma_ti_per_map(peripheral: u32) -> u32 {
    peripheral << 16
}

pub const fn dma_ti_txfr_len_ylength(y: u32) -> u32 {
    (y & 0x3fff) << 16
}

pub const fn dma_ti_txfr_len_xlength(x: u32) -> u32 {
    x & 0xffff
}

pub const fn dma_ti_stride_d(stride: u32) -> u32 {
    (stride & 0xffff) << 16
}

pub const fn dma_ti_stride_s(stride: u32) -> u32 {
    stride & 0xffff
}

pub const fn dma_cs_priority(priority: u32) -> u32 {
    (priority & 0xf) << 16
}

pub const fn dma_cs_panic_priority(priority: u32) -> u32 {
    (priority & 0xf) << 20
}

pub const PWM_BASE: u32 = 0x0020_C000;
pub const PHYSICAL_PWM_BUS: u32 = 0x7E00_0000 + PWM_BASE;
pub const PWM_CTL: usize = 0x00;
pub const PWM_DMAC: usize = 0x08;
pub const PWM_RNG1: usize = 0x10;
pub const PWM_FIFO: usize = 0x18;
pub const PWM_CTL_PWEN1: u32 = 1 << 0;
pub const PWM_CTL_CLRF: u32 = 1 << 6;
pub const PWM_CTL_USEF1: u32 = 1 << 5;
pub const PWM_DMAC_ENAB: u32 = 1 << 31;

pub const fn pwm_dmac_panic(threshold: u32) -> u32 {
    threshold << 8
}

pub const fn pwm_dmac_dreq(threshold: u32) -> u32 {
    threshold
}

pub const CM_BASE: u32 = 0x0010_1000;
pub const CM_PWM_CNTL: usize = 0xA0;
pub const CM_PWM_DIV: usize = 0xA4;
pub const CM_PASSWORD: u32 = 0x5A << 24;
pub const CM_CNTL_ENABLE: u32 = 1 << 4;
pub const CM_CNTL_BUSY: u32 = 1 << 7;
/// 500 MHz PLLD clock source.
pub const CM_SRC_PLLD: u32 = 6;

pub const fn cm_div_value(divisor: u32) -> u32 {
    divisor << 12
}
