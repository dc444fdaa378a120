use std::borrow::Cow;

#[derive(Debug, Clone)]
pub struct TensorView<'a, T: Clone = f32> {
    pub data: Cow<'a, [T]>,
    pub shape: Cow<'a, [usize]>,
}

impl<'a, T: Clone> TensorView<'a, T> {
    pub fn new(data: &'a [T], shape: &'a [usize]) -> Self {
        let len: usize = shape.iter().product();
        assert_eq!(data.len(), len, "Data length mismatch");
        Self {
            data: Cow::Borrowed(data),
            shape: Cow::Borrowed(shape),
        }
    }
    pub fn from_owned(data: Vec<T>, shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        assert_eq!(data.len(), len, "Data length mismatch");
        Self {
            data: Cow::Owned(data),
            shape: Cow::Owned(shape),
        }
    }
    pub fn from_slice(data: &'a [T], shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        assert_eq!(data.len(), len, "Data length mismatch");
        Self {
            data: Cow::Borrowed(data),
            shape: Cow::Owned(shape),
        }
    }
    /// Rank-0 tensor holding a single value.
    pub fn scalar(value: T) -> Self {
        Self {
            data: Cow::Owned(vec![value]),
            shape: Cow::Owned(Vec::new()),
        }
    }
    pub fn to_owned(&self) -> TensorView<'static, T>
    where
        T: 'static,
    {
        TensorView::from_owned(self.data.to_vec(), self.shape.to_vec())
    }
    pub fn dim(&self) -> usize {
        self.shape.len()
    }
    pub fn size(&self, dim: usize) -> usize {
        self.shape[dim]
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    /// True for a rank-0 tensor or a rank-1 tensor of exactly one element.
    pub fn is_scalar_or_single(&self) -> bool {
        match self.shape.len() {
            0 => true,
            1 => self.shape[0] == 1,
            _ => false,
        }
    }
}

/// Filter element type: quantized weights arrive as either `u8` or `i8`.
#[derive(Debug, Clone)]
pub enum WeightTensor<'a> {
    U8(TensorView<'a, u8>),
    I8(TensorView<'a, i8>),
}

impl<'a> WeightTensor<'a> {
    pub fn shape(&self) -> &[usize] {
        match self {
            WeightTensor::U8(t) => &t.shape,
            WeightTensor::I8(t) => &t.shape,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            WeightTensor::U8(t) => t.len(),
            WeightTensor::I8(t) => t.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn is_signed(&self) -> bool {
        matches!(self, WeightTensor::I8(_))
    }
    pub fn is_scalar_or_single(&self) -> bool {
        match self {
            WeightTensor::U8(t) => t.is_scalar_or_single(),
            WeightTensor::I8(t) => t.is_scalar_or_single(),
        }
    }
    /// Raw byte pattern of element `i` (i8 values are reinterpreted, not converted).
    #[inline]
    pub fn byte(&self, i: usize) -> u8 {
        match self {
            WeightTensor::U8(t) => t.data[i],
            WeightTensor::I8(t) => t.data[i] as u8,
        }
    }
    /// Numeric value of element `i`, widened according to the element type.
    #[inline]
    pub fn value(&self, i: usize) -> i32 {
        match self {
            WeightTensor::U8(t) => t.data[i] as i32,
            WeightTensor::I8(t) => t.data[i] as i32,
        }
    }
    pub fn to_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            WeightTensor::U8(t) => Cow::Borrowed(&t.data[..]),
            WeightTensor::I8(t) => Cow::Owned(t.data.iter().map(|&v| v as u8).collect()),
        }
    }
}

impl<'a> From<TensorView<'a, u8>> for WeightTensor<'a> {
    fn from(t: TensorView<'a, u8>) -> Self {
        WeightTensor::U8(t)
    }
}

impl<'a> From<TensorView<'a, i8>> for WeightTensor<'a> {
    fn from(t: TensorView<'a, i8>) -> Self {
        WeightTensor::I8(t)
    }
}

/// Widen a raw filter byte to its numeric value.
#[inline(always)]
pub fn widen_weight(byte: u8, signed: bool) -> i32 {
    if signed {
        byte as i8 as i32
    } else {
        byte as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_scalar_or_single() {
        assert!(TensorView::scalar(3u8).is_scalar_or_single());
        assert!(TensorView::from_owned(vec![1.0f32], vec![1]).is_scalar_or_single());
        assert!(!TensorView::from_owned(vec![1.0f32, 2.0], vec![2]).is_scalar_or_single());
        assert!(!TensorView::from_owned(vec![1.0f32], vec![1, 1]).is_scalar_or_single());
    }
    #[test]
    fn test_weight_bytes_keep_bit_pattern() {
        let w: WeightTensor = TensorView::from_owned(vec![-1i8, 5, -128], vec![3]).into();
        assert!(w.is_signed());
        assert_eq!(w.to_bytes().as_ref(), &[0xFF, 5, 0x80]);
        assert_eq!(w.value(0), -1);
        assert_eq!(widen_weight(w.byte(2), true), -128);
        assert_eq!(widen_weight(0x80, false), 128);
    }
}
