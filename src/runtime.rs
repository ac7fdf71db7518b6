//! Surface of the C runtime the generated code links against.
//!
//! The runtime itself is a separate object file (`runtime.o`); the compiler
//! only knows this symbol table. Every entry is C-ABI. Heap objects (list,
//! dict, range) carry a refcount header and are managed through their
//! `*_retain`/`*_release` pairs; all invariant violations (null receiver,
//! out-of-range index, missing key, zero step) write one diagnostic line to
//! stderr and terminate the process with a non-zero exit code.

/// Where an argument or result lives for ABI purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiType {
    /// Integer or pointer in a GPR.
    Int,
    /// `double` in an XMM register.
    Float,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeFnSpec {
    pub symbol: &'static str,
    pub params: &'static [AbiType],
    pub ret: Option<AbiType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    // Allocation
    Malloc,
    Free,
    // Lists
    ListNew,
    ListFromData,
    ListLen,
    ListGet,
    ListSet,
    ListAppend,
    ListPop,
    ListInsert,
    ListConcat,
    ListRepeat,
    ListExtend,
    ListPrint,
    ListRetain,
    ListRelease,
    // Dicts
    DictNew,
    DictLen,
    DictGet,
    DictGetDefault,
    DictSet,
    DictContains,
    DictDelete,
    DictPop,
    DictPopDefault,
    DictKeys,
    DictValues,
    DictItems,
    DictClear,
    DictUpdate,
    DictRetain,
    DictRelease,
    // Ranges
    RangeNew,
    RangeNewStop,
    RangeNewStartStop,
    RangeLen,
    RangeGet,
    RangeToList,
    RangeRetain,
    RangeRelease,
    // Strings and stringification
    StringConcatParts,
    IntToString,
    FloatToString,
    BoolToString,
    StringToString,
    StringToInt,
    StringToFloat,
    // IO
    Input,
    InputPrompt,
    PrintInt,
    PrintFloat,
    PrintBool,
    PrintString,
    PrintSmart,
}

impl RuntimeFn {
    pub const fn spec(self) -> RuntimeFnSpec {
        use AbiType::*;
        match self {
            RuntimeFn::Malloc => RuntimeFnSpec {
                symbol: "orion_malloc",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::Free => RuntimeFnSpec {
                symbol: "orion_free",
                params: &[Int],
                ret: None,
            },
            RuntimeFn::ListNew => RuntimeFnSpec {
                symbol: "list_new",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::ListFromData => RuntimeFnSpec {
                symbol: "list_from_data",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::ListLen => RuntimeFnSpec {
                symbol: "list_len",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::ListGet => RuntimeFnSpec {
                symbol: "list_get",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::ListSet => RuntimeFnSpec {
                symbol: "list_set",
                params: &[Int, Int, Int],
                ret: None,
            },
            RuntimeFn::ListAppend => RuntimeFnSpec {
                symbol: "list_append",
                params: &[Int, Int],
                ret: None,
            },
            RuntimeFn::ListPop => RuntimeFnSpec {
                symbol: "list_pop",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::ListInsert => RuntimeFnSpec {
                symbol: "list_insert",
                params: &[Int, Int, Int],
                ret: None,
            },
            RuntimeFn::ListConcat => RuntimeFnSpec {
                symbol: "list_concat",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::ListRepeat => RuntimeFnSpec {
                symbol: "list_repeat",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::ListExtend => RuntimeFnSpec {
                symbol: "list_extend",
                params: &[Int, Int],
                ret: None,
            },
            RuntimeFn::ListPrint => RuntimeFnSpec {
                symbol: "list_print",
                params: &[Int],
                ret: None,
            },
            RuntimeFn::ListRetain => RuntimeFnSpec {
                symbol: "list_retain",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::ListRelease => RuntimeFnSpec {
                symbol: "list_release",
                params: &[Int],
                ret: None,
            },
            RuntimeFn::DictNew => RuntimeFnSpec {
                symbol: "dict_new",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::DictLen => RuntimeFnSpec {
                symbol: "dict_len",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::DictGet => RuntimeFnSpec {
                symbol: "dict_get",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::DictGetDefault => RuntimeFnSpec {
                symbol: "dict_get_default",
                params: &[Int, Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::DictSet => RuntimeFnSpec {
                symbol: "dict_set",
                params: &[Int, Int, Int],
                ret: None,
            },
            RuntimeFn::DictContains => RuntimeFnSpec {
                symbol: "dict_contains",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::DictDelete => RuntimeFnSpec {
                symbol: "dict_delete",
                params: &[Int, Int],
                ret: None,
            },
            RuntimeFn::DictPop => RuntimeFnSpec {
                symbol: "dict_pop",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::DictPopDefault => RuntimeFnSpec {
                symbol: "dict_pop_default",
                params: &[Int, Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::DictKeys => RuntimeFnSpec {
                symbol: "dict_keys",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::DictValues => RuntimeFnSpec {
                symbol: "dict_values",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::DictItems => RuntimeFnSpec {
                symbol: "dict_items",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::DictClear => RuntimeFnSpec {
                symbol: "dict_clear",
                params: &[Int],
                ret: None,
            },
            RuntimeFn::DictUpdate => RuntimeFnSpec {
                symbol: "dict_update",
                params: &[Int, Int],
                ret: None,
            },
            RuntimeFn::DictRetain => RuntimeFnSpec {
                symbol: "dict_retain",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::DictRelease => RuntimeFnSpec {
                symbol: "dict_release",
                params: &[Int],
                ret: None,
            },
            RuntimeFn::RangeNew => RuntimeFnSpec {
                symbol: "range_new",
                params: &[Int, Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::RangeNewStop => RuntimeFnSpec {
                symbol: "range_new_stop",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::RangeNewStartStop => RuntimeFnSpec {
                symbol: "range_new_start_stop",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::RangeLen => RuntimeFnSpec {
                symbol: "range_len",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::RangeGet => RuntimeFnSpec {
                symbol: "range_get",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::RangeToList => RuntimeFnSpec {
                symbol: "range_to_list",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::RangeRetain => RuntimeFnSpec {
                symbol: "range_retain",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::RangeRelease => RuntimeFnSpec {
                symbol: "range_release",
                params: &[Int],
                ret: None,
            },
            RuntimeFn::StringConcatParts => RuntimeFnSpec {
                symbol: "string_concat_parts",
                params: &[Int, Int],
                ret: Some(Int),
            },
            RuntimeFn::IntToString => RuntimeFnSpec {
                symbol: "int_to_string",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::FloatToString => RuntimeFnSpec {
                symbol: "float_to_string",
                params: &[Float],
                ret: Some(Int),
            },
            RuntimeFn::BoolToString => RuntimeFnSpec {
                symbol: "bool_to_string",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::StringToString => RuntimeFnSpec {
                symbol: "string_to_string",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::StringToInt => RuntimeFnSpec {
                symbol: "__orion_string_to_int",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::StringToFloat => RuntimeFnSpec {
                symbol: "__orion_string_to_float",
                params: &[Int],
                ret: Some(Float),
            },
            RuntimeFn::Input => RuntimeFnSpec {
                symbol: "orion_input",
                params: &[],
                ret: Some(Int),
            },
            RuntimeFn::InputPrompt => RuntimeFnSpec {
                symbol: "orion_input_prompt",
                params: &[Int],
                ret: Some(Int),
            },
            RuntimeFn::PrintInt => RuntimeFnSpec {
                symbol: "print_int",
                params: &[Int],
                ret: None,
            },
            RuntimeFn::PrintFloat => RuntimeFnSpec {
                symbol: "print_float",
                params: &[Float],
                ret: None,
            },
            RuntimeFn::PrintBool => RuntimeFnSpec {
                symbol: "print_bool",
                params: &[Int],
                ret: None,
            },
            RuntimeFn::PrintString => RuntimeFnSpec {
                symbol: "print_string",
                params: &[Int],
                ret: None,
            },
            RuntimeFn::PrintSmart => RuntimeFnSpec {
                symbol: "print_smart",
                params: &[Int],
                ret: None,
            },
        }
    }

    pub const fn symbol(self) -> &'static str {
        self.spec().symbol
    }
}

/// Every runtime entry, in a stable order. Used for extern bookkeeping and
/// for asserting table consistency.
pub const ALL: &[RuntimeFn] = &[
    RuntimeFn::Malloc,
    RuntimeFn::Free,
    RuntimeFn::ListNew,
    RuntimeFn::ListFromData,
    RuntimeFn::ListLen,
    RuntimeFn::ListGet,
    RuntimeFn::ListSet,
    RuntimeFn::ListAppend,
    RuntimeFn::ListPop,
    RuntimeFn::ListInsert,
    RuntimeFn::ListConcat,
    RuntimeFn::ListRepeat,
    RuntimeFn::ListExtend,
    RuntimeFn::ListPrint,
    RuntimeFn::ListRetain,
    RuntimeFn::ListRelease,
    RuntimeFn::DictNew,
    RuntimeFn::DictLen,
    RuntimeFn::DictGet,
    RuntimeFn::DictGetDefault,
    RuntimeFn::DictSet,
    RuntimeFn::DictContains,
    RuntimeFn::DictDelete,
    RuntimeFn::DictPop,
    RuntimeFn::DictPopDefault,
    RuntimeFn::DictKeys,
    RuntimeFn::DictValues,
    RuntimeFn::DictItems,
    RuntimeFn::DictClear,
    RuntimeFn::DictUpdate,
    RuntimeFn::DictRetain,
    RuntimeFn::DictRelease,
    RuntimeFn::RangeNew,
    RuntimeFn::RangeNewStop,
    RuntimeFn::RangeNewStartStop,
    RuntimeFn::RangeLen,
    RuntimeFn::RangeGet,
    RuntimeFn::RangeToList,
    RuntimeFn::RangeRetain,
    RuntimeFn::RangeRelease,
    RuntimeFn::StringConcatParts,
    RuntimeFn::IntToString,
    RuntimeFn::FloatToString,
    RuntimeFn::BoolToString,
    RuntimeFn::StringToString,
    RuntimeFn::StringToInt,
    RuntimeFn::StringToFloat,
    RuntimeFn::Input,
    RuntimeFn::InputPrompt,
    RuntimeFn::PrintInt,
    RuntimeFn::PrintFloat,
    RuntimeFn::PrintBool,
    RuntimeFn::PrintString,
    RuntimeFn::PrintSmart,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn symbols_are_unique() {
        let mut seen = HashSet::new();
        for entry in ALL {
            assert!(
                seen.insert(entry.symbol()),
                "duplicate runtime symbol {}",
                entry.symbol()
            );
        }
    }

    #[test]
    fn float_abi_entries_are_marked() {
        assert_eq!(RuntimeFn::PrintFloat.spec().params, &[AbiType::Float]);
        assert_eq!(RuntimeFn::FloatToString.spec().params, &[AbiType::Float]);
        assert_eq!(RuntimeFn::StringToFloat.spec().ret, Some(AbiType::Float));
    }

    #[test]
    fn retain_release_pairs_exist_for_every_refcounted_kind() {
        for (retain, release) in [
            (RuntimeFn::ListRetain, RuntimeFn::ListRelease),
            (RuntimeFn::DictRetain, RuntimeFn::DictRelease),
            (RuntimeFn::RangeRetain, RuntimeFn::RangeRelease),
        ] {
            assert!(retain.spec().ret.is_some());
            assert!(release.spec().ret.is_none());
        }
    }
}
