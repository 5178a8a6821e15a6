use super::{Value, VmError, VmResult};

/// Host functions every routine can reach through `load_global`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Abs,
    Cos,
    Sin,
    Sqrt,
    Floor,
    Len,
    Str,
    Int,
    Float,
    Min,
    Max,
    Neg,
}

impl Builtin {
    const ALL: [Builtin; 12] = [
        Builtin::Abs,
        Builtin::Cos,
        Builtin::Sin,
        Builtin::Sqrt,
        Builtin::Floor,
        Builtin::Len,
        Builtin::Str,
        Builtin::Int,
        Builtin::Float,
        Builtin::Min,
        Builtin::Max,
        Builtin::Neg,
    ];

    pub fn lookup(name: &str) -> Option<Builtin> {
        Builtin::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Abs => "abs",
            Builtin::Cos => "cos",
            Builtin::Sin => "sin",
            Builtin::Sqrt => "sqrt",
            Builtin::Floor => "floor",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Neg => "neg",
        }
    }

    pub fn call(self, args: &[Value]) -> VmResult<Value> {
        match self {
            Builtin::Min | Builtin::Max => return self.extremum(args),
            _ => {}
        }
        let [arg] = args else {
            return Err(VmError::Type(format!(
                "{}() takes exactly one argument ({} given)",
                self.name(),
                args.len()
            )));
        };
        match (self, arg) {
            (Builtin::Abs, Value::Int(n)) => n
                .checked_abs()
                .map(Value::Int)
                .ok_or(VmError::Overflow),
            (Builtin::Abs, Value::Float(x)) => Ok(Value::Float(x.abs())),
            (Builtin::Neg, Value::Int(n)) => n
                .checked_neg()
                .map(Value::Int)
                .ok_or(VmError::Overflow),
            (Builtin::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
            (Builtin::Cos, v) => self.float_fn(v, f64::cos),
            (Builtin::Sin, v) => self.float_fn(v, f64::sin),
            (Builtin::Sqrt, v) => self.float_fn(v, f64::sqrt),
            (Builtin::Floor, v) => {
                let x = self.expect_number(v)?;
                let floored = x.floor();
                if floored.is_finite() && floored.abs() < i64::MAX as f64 {
                    Ok(Value::Int(floored as i64))
                } else {
                    Err(VmError::Overflow)
                }
            }
            (Builtin::Len, Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
            (Builtin::Len, Value::Tuple(items)) => Ok(Value::Int(items.len() as i64)),
            (Builtin::Str, v) => Ok(Value::str(&v.to_string())),
            (Builtin::Int, Value::Int(n)) => Ok(Value::Int(*n)),
            (Builtin::Int, Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
            (Builtin::Int, Value::Float(x)) if x.is_finite() => Ok(Value::Int(x.trunc() as i64)),
            (Builtin::Int, Value::Str(s)) => s
                .trim()
                .parse()
                .map(Value::Int)
                .map_err(|_| VmError::Type(format!("invalid literal for int(): {s:?}"))),
            (Builtin::Float, v) => match v {
                Value::Str(s) => s
                    .trim()
                    .parse()
                    .map(Value::Float)
                    .map_err(|_| VmError::Type(format!("could not convert string to float: {s:?}"))),
                other => self.expect_number(other).map(Value::Float),
            },
            (_, v) => Err(VmError::Type(format!(
                "bad argument type for {}(): '{}'",
                self.name(),
                v.type_name()
            ))),
        }
    }

    fn expect_number(self, v: &Value) -> VmResult<f64> {
        v.as_f64().ok_or_else(|| {
            VmError::Type(format!("{}() needs a number, not '{}'", self.name(), v.type_name()))
        })
    }

    fn float_fn(self, v: &Value, f: fn(f64) -> f64) -> VmResult<Value> {
        self.expect_number(v).map(|x| Value::Float(f(x)))
    }

    fn extremum(self, args: &[Value]) -> VmResult<Value> {
        let items: &[Value] = match args {
            [Value::Tuple(items)] => items,
            _ => args,
        };
        let mut best: Option<&Value> = None;
        for item in items {
            let x = self.expect_number(item)?;
            let better = match best.and_then(Value::as_f64) {
                None => true,
                Some(b) if self == Builtin::Min => x < b,
                Some(b) => x > b,
            };
            if better {
                best = Some(item);
            }
        }
        best.cloned()
            .ok_or_else(|| VmError::Type(format!("{}() arg is an empty sequence", self.name())))
    }
}
