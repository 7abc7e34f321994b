// MIT License
//
// Copyright (c) 2019 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Argument injection for pool tasks.

use crate::error::{InjectError, PoolError};

use std::{
    any::{self, Any, TypeId},
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
};

/// A set of values, at most one per type, that injected tasks draw their
/// arguments from.
///
/// ```
/// use strand::{Injector, Pool};
///
/// let mut injector = Injector::new();
/// injector.provide(String::from("db://primary")).provide(3u32);
///
/// let pool = Pool::builder().size(1).injector(injector).build();
///
/// pool.execute_injected(|url: String, retries: u32| {
///     assert_eq!(url, "db://primary");
///     assert_eq!(retries, 3);
/// })
/// .unwrap();
/// ```
#[derive(Default)]
pub struct Injector {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Injector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `value` as the argument for every parameter of type `T`,
    /// replacing any earlier binding for `T`.
    pub fn provide<T: Any + Send + Sync>(&mut self, value: T) -> &mut Self {
        self.values.insert(TypeId::of::<T>(), Box::new(value));

        self
    }

    /// Returns a copy of the value bound for `T`.
    pub fn resolve<T: Any + Clone>(&self) -> Result<T, InjectError> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
            .ok_or(InjectError::Missing(any::type_name::<T>()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Debug for Injector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("bindings", &self.values.len())
            .finish()
    }
}

/// What an injected task may return.
pub trait TaskOutput {
    fn into_result(self) -> Result<(), String>;
}

impl TaskOutput for () {
    fn into_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: Display> TaskOutput for Result<(), E> {
    fn into_result(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// A callable whose arguments are all resolved from an [`Injector`].
///
/// Implemented for closures and functions of up to four parameters whose
/// types are `Clone` and whose return type is `()` or `Result<(), E>`.
///
/// [`Injector`]: struct.Injector.html
pub trait Inject<Args>: Send + 'static {
    fn invoke(self, injector: &Injector) -> Result<(), PoolError>;
}

macro_rules! impl_inject {
    ($($arg:ident),*) => {
        impl<Func, Out, $($arg,)*> Inject<($($arg,)*)> for Func
        where
            Func: FnOnce($($arg),*) -> Out + Send + 'static,
            Out: TaskOutput,
            $($arg: Any + Clone,)*
        {
            #[allow(non_snake_case, unused_variables)]
            fn invoke(self, injector: &Injector) -> Result<(), PoolError> {
                $(let $arg = injector.resolve::<$arg>()?;)*

                (self)($($arg),*).into_result().map_err(PoolError::Task)
            }
        }
    };
}

impl_inject!();
impl_inject!(A);
impl_inject!(A, B);
impl_inject!(A, B, C);
impl_inject!(A, B, C, D);

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    #[test]
    fn resolves_by_type() {
        let mut injector = Injector::new();
        injector.provide(7u64).provide("name");

        assert_eq!(injector.len(), 2);
        assert_eq!(injector.resolve::<u64>(), Ok(7));
        assert_eq!(injector.resolve::<&str>(), Ok("name"));
        assert_eq!(
            injector.resolve::<u32>(),
            Err(InjectError::Missing(any::type_name::<u32>()))
        );

        injector.provide(8u64);
        assert_eq!(injector.resolve::<u64>(), Ok(8));
    }

    #[test]
    fn invokes_with_resolved_arguments() {
        let seen = Arc::new(Mutex::new(Vec::<i32>::new()));

        let mut injector = Injector::new();
        injector.provide(seen.clone()).provide(5i32).provide(2usize);

        let task = |seen: Arc<Mutex<Vec<i32>>>, value: i32, times: usize| {
            seen.lock().unwrap().extend(std::iter::repeat(value).take(times));
        };

        assert_eq!(task.invoke(&injector), Ok(()));
        assert_eq!(*seen.lock().unwrap(), vec![5, 5]);
    }

    #[test]
    fn reports_missing_arguments_and_task_errors() {
        let injector = Injector::new();

        assert_eq!(
            (|_: u8| ()).invoke(&injector),
            Err(PoolError::Inject(InjectError::Missing(any::type_name::<u8>())))
        );

        assert_eq!(
            (|| -> Result<(), String> { Err("nope".to_owned()) }).invoke(&injector),
            Err(PoolError::Task("nope".to_owned()))
        );

        assert_eq!((|| ()).invoke(&injector), Ok(()));
    }
}
